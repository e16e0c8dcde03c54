//! Per-operation sample storage.
//!
//! Every measurement in the engine (profiled scopes, benchmark iterations)
//! lands here as an immutable [`Sample`]. Each operation owns a fixed-capacity
//! ring; the oldest sample is evicted on overflow. Readers only ever see
//! point-in-time snapshots, never live views.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One timestamped observation of a named operation. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub operation: String,
    /// Unix epoch milliseconds.
    pub timestamp_ms: u64,
    pub duration_ms: f64,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub success: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Sample {
    /// A successful wall-clock-only sample, timestamped now.
    pub fn timed(operation: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            operation: operation.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            duration_ms,
            cpu_percent: 0.0,
            memory_bytes: 0,
            success: true,
            labels: HashMap::new(),
        }
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, cpu_percent: f64, memory_bytes: u64) -> Self {
        self.cpu_percent = cpu_percent;
        self.memory_bytes = memory_bytes;
        self
    }
}

type OperationRing = Arc<Mutex<VecDeque<Sample>>>;

/// Capacity-bounded sample rings, one per operation name.
///
/// Recording for an unknown operation creates its ring implicitly; snapshots
/// of unknown operations return an empty vec. Locking is per-operation: the
/// outer map lock is only held long enough to find or create the ring.
pub struct SampleBuffer {
    capacity: usize,
    rings: RwLock<FxHashMap<String, OperationRing>>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ring(&self, operation: &str) -> OperationRing {
        if let Some(ring) = self.rings.read().unwrap().get(operation) {
            return Arc::clone(ring);
        }
        let mut rings = self.rings.write().unwrap();
        Arc::clone(
            rings
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new()))),
        )
    }

    /// Append a sample, evicting the oldest entry if the ring is full.
    /// O(1) amortized.
    pub fn record(&self, sample: Sample) {
        let ring = self.ring(&sample.operation);
        let mut ring = ring.lock().unwrap();
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Point-in-time copy of an operation's samples in insertion order.
    pub fn snapshot(&self, operation: &str) -> Vec<Sample> {
        match self.rings.read().unwrap().get(operation) {
            Some(ring) => ring.lock().unwrap().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, operation: &str) -> usize {
        match self.rings.read().unwrap().get(operation) {
            Some(ring) => ring.lock().unwrap().len(),
            None => 0,
        }
    }

    pub fn is_empty(&self, operation: &str) -> bool {
        self.len(operation) == 0
    }

    /// All operation names with a ring, sorted for deterministic reporting.
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rings.read().unwrap().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Clear history for one operation. Unknown operations are a no-op.
    pub fn reset(&self, operation: &str) {
        if let Some(ring) = self.rings.read().unwrap().get(operation) {
            ring.lock().unwrap().clear();
        }
    }

    /// Drop every ring.
    pub fn reset_all(&self) {
        self.rings.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample(op: &str, duration_ms: f64) -> Sample {
        Sample::timed(op, duration_ms)
    }

    #[test]
    fn keeps_exactly_the_most_recent_capacity_samples() {
        let buffer = SampleBuffer::new(5);
        for i in 0..12 {
            buffer.record(sample("db_query", i as f64));
        }

        let snapshot = buffer.snapshot("db_query");
        assert_eq!(snapshot.len(), 5);
        let durations: Vec<f64> = snapshot.iter().map(|s| s.duration_ms).collect();
        assert_eq!(durations, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn snapshot_of_unknown_operation_is_empty() {
        let buffer = SampleBuffer::new(10);
        assert!(buffer.snapshot("never_recorded").is_empty());
        assert_eq!(buffer.len("never_recorded"), 0);
    }

    #[test]
    fn reset_clears_a_single_operation() {
        let buffer = SampleBuffer::new(10);
        buffer.record(sample("a", 1.0));
        buffer.record(sample("b", 2.0));

        buffer.reset("a");
        assert!(buffer.is_empty("a"));
        assert_eq!(buffer.len("b"), 1);

        buffer.reset_all();
        assert!(buffer.operations().is_empty());
    }

    #[test]
    fn labels_and_failure_builders() {
        let s = sample("op", 3.0).failed().with_label("cancelled", "true");
        assert!(!s.success);
        assert_eq!(s.labels.get("cancelled").map(String::as_str), Some("true"));
    }

    #[test]
    fn concurrent_recording_loses_no_samples() {
        let buffer = Arc::new(SampleBuffer::new(50_000));
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        buffer.record(sample("shared_op", (t * per_thread + i) as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.len("shared_op"), threads * per_thread);
    }

    #[test]
    fn concurrent_recording_respects_capacity() {
        let buffer = Arc::new(SampleBuffer::new(100));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..1000 {
                        buffer.record(sample("bounded_op", i as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.len("bounded_op"), 100);
    }
}
