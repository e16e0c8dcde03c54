//! Scoped profiling of arbitrary operations.
//!
//! [`Profiler::begin_scope`] hands back an RAII guard; dropping it (on any
//! exit path, panics included) computes elapsed wall-clock time and the CPU
//! and memory deltas, then records the sample into the shared
//! [`SampleBuffer`]. A background tick augments still-open scopes with
//! interim CPU/memory readings so long operations are captured before they
//! finish.
//!
//! Named profiling sessions aggregate every scope closed while they were
//! active into a [`ProfileReport`]. Each session sits behind its own mutex,
//! so unrelated sessions never contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::error::{PerfError, Result};
use crate::sample::{Sample, SampleBuffer};

/// Point-in-time CPU/memory reading for this process.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResourceReading {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Process-level resource sampler shared by all scopes.
pub(crate) struct SystemSampler {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemSampler {
    pub(crate) fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            pid: Pid::from(std::process::id() as usize),
        }
    }

    pub(crate) fn read(&self) -> ResourceReading {
        let mut system = self.system.lock().unwrap();
        system.refresh_processes();
        match system.process(self.pid) {
            Some(process) => ResourceReading {
                cpu_percent: process.cpu_usage() as f64,
                memory_bytes: process.memory(),
            },
            None => ResourceReading::default(),
        }
    }
}

/// Interim state for a scope that has not closed yet. Updated by the
/// background sampling tick.
struct OpenScope {
    operation: String,
    peak_memory_bytes: u64,
    cpu_readings: Vec<f64>,
}

/// One closed scope as seen by a profiling session.
#[derive(Debug, Clone)]
struct ScopeEntry {
    operation: String,
    duration_ms: f64,
    cpu_percent: f64,
    peak_memory_bytes: u64,
    success: bool,
}

struct SessionState {
    started_at_ms: u64,
    entries: Vec<ScopeEntry>,
}

type SessionHandle = Arc<Mutex<SessionState>>;

/// Aggregated statistics for one operation within a profile report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation: String,
    pub total_calls: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub avg_cpu_percent: f64,
    pub peak_memory_bytes: u64,
    pub failure_count: u64,
}

/// Summary of every scope closed during a profiling session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub profile_id: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub scope_count: usize,
    pub avg_duration_ms: f64,
    pub avg_cpu_percent: f64,
    pub peak_memory_bytes: u64,
    pub per_operation: HashMap<String, OperationStats>,
}

pub struct Profiler {
    buffer: Arc<SampleBuffer>,
    sampler: Arc<SystemSampler>,
    open_scopes: Arc<Mutex<FxHashMap<u64, OpenScope>>>,
    sessions: Mutex<FxHashMap<String, SessionHandle>>,
    next_scope_id: AtomicU64,
    sampling_interval: Duration,
}

impl Profiler {
    pub fn new(buffer: Arc<SampleBuffer>, sampling_interval: Duration) -> Self {
        Self {
            buffer,
            sampler: Arc::new(SystemSampler::new()),
            open_scopes: Arc::new(Mutex::new(FxHashMap::default())),
            sessions: Mutex::new(FxHashMap::default()),
            next_scope_id: AtomicU64::new(0),
            sampling_interval,
        }
    }

    /// Open a measurement scope around some unit of work. The scope is
    /// tagged with every profiling session active at open time.
    pub fn begin_scope(&self, operation: impl Into<String>) -> ScopeGuard {
        let operation = operation.into();
        let scope_id = self.next_scope_id.fetch_add(1, Ordering::Relaxed);
        let start_reading = self.sampler.read();
        let sessions: Vec<SessionHandle> =
            self.sessions.lock().unwrap().values().cloned().collect();

        self.open_scopes.lock().unwrap().insert(
            scope_id,
            OpenScope {
                operation: operation.clone(),
                peak_memory_bytes: start_reading.memory_bytes,
                cpu_readings: Vec::new(),
            },
        );

        ScopeGuard {
            scope_id,
            operation,
            started: Instant::now(),
            failed: false,
            cancelled: false,
            labels: HashMap::new(),
            start_reading,
            buffer: Arc::clone(&self.buffer),
            sampler: Arc::clone(&self.sampler),
            open_scopes: Arc::clone(&self.open_scopes),
            sessions,
        }
    }

    /// Begin aggregating closed scopes under `profile_id`. Restarting an
    /// already-active session discards its accumulated scopes.
    pub fn start_profiling(&self, profile_id: impl Into<String>) {
        let profile_id = profile_id.into();
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&profile_id) {
            warn!("profiling session '{}' already active, restarting", profile_id);
        }
        sessions.insert(
            profile_id,
            Arc::new(Mutex::new(SessionState {
                started_at_ms: chrono::Utc::now().timestamp_millis() as u64,
                entries: Vec::new(),
            })),
        );
    }

    /// Close the session and aggregate everything it saw.
    pub fn stop_profiling(&self, profile_id: &str) -> Result<ProfileReport> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(profile_id)
            .ok_or_else(|| PerfError::SessionNotFound(profile_id.to_string()))?;

        let state = session.lock().unwrap();
        Ok(build_report(profile_id, state.started_at_ms, &state.entries))
    }

    pub fn open_scope_count(&self) -> usize {
        self.open_scopes.lock().unwrap().len()
    }

    fn sample_open_scopes(&self) {
        // Read outside the scope lock so the sampler and registry locks
        // never nest.
        let reading = self.sampler.read();
        let mut scopes = self.open_scopes.lock().unwrap();
        if scopes.is_empty() {
            return;
        }
        for scope in scopes.values_mut() {
            scope.peak_memory_bytes = scope.peak_memory_bytes.max(reading.memory_bytes);
            scope.cpu_readings.push(reading.cpu_percent);
        }
        debug!("sampling tick updated {} open scopes", scopes.len());
    }

    /// Spawn the interim sampling tick. Owned by the engine lifecycle.
    pub fn spawn_sampling_tick(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let profiler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(profiler.sampling_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                profiler.sample_open_scopes();
            }
        })
    }
}

/// RAII measurement scope. Dropping it records the sample exactly once,
/// no matter how the enclosing block exits.
pub struct ScopeGuard {
    scope_id: u64,
    operation: String,
    started: Instant,
    failed: bool,
    cancelled: bool,
    labels: HashMap<String, String>,
    start_reading: ResourceReading,
    buffer: Arc<SampleBuffer>,
    sampler: Arc<SystemSampler>,
    open_scopes: Arc<Mutex<FxHashMap<u64, OpenScope>>>,
    sessions: Vec<SessionHandle>,
}

impl ScopeGuard {
    /// Mark the scope as having exited via an error path.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// External cancellation: the sample is still recorded, with
    /// success=false and a `cancelled` label, never silently dropped.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let end_reading = self.sampler.read();
        let open = self.open_scopes.lock().unwrap().remove(&self.scope_id);

        let peak_memory = open
            .as_ref()
            .map(|s| s.peak_memory_bytes)
            .unwrap_or(0)
            .max(end_reading.memory_bytes);

        // Prefer the interim tick readings for long scopes; fall back to the
        // end-minus-start delta for scopes shorter than one tick.
        let cpu_percent = match &open {
            Some(scope) if !scope.cpu_readings.is_empty() => {
                scope.cpu_readings.iter().sum::<f64>() / scope.cpu_readings.len() as f64
            }
            _ => (end_reading.cpu_percent - self.start_reading.cpu_percent).max(0.0),
        };
        let memory_delta = end_reading
            .memory_bytes
            .saturating_sub(self.start_reading.memory_bytes);

        let success = !self.failed && !self.cancelled && !std::thread::panicking();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;

        let mut sample = Sample::timed(self.operation.clone(), duration_ms)
            .with_resources(cpu_percent, memory_delta);
        sample.success = success;
        sample.labels = std::mem::take(&mut self.labels);
        if self.cancelled {
            sample.labels.insert("cancelled".to_string(), "true".to_string());
        }
        self.buffer.record(sample);

        let entry = ScopeEntry {
            operation: self.operation.clone(),
            duration_ms,
            cpu_percent,
            peak_memory_bytes: peak_memory,
            success,
        };
        for session in &self.sessions {
            session.lock().unwrap().entries.push(entry.clone());
        }
    }
}

fn build_report(profile_id: &str, started_at_ms: u64, entries: &[ScopeEntry]) -> ProfileReport {
    let mut per_operation: HashMap<String, OperationStats> = HashMap::new();
    for entry in entries {
        let stats = per_operation
            .entry(entry.operation.clone())
            .or_insert_with(|| OperationStats {
                operation: entry.operation.clone(),
                total_calls: 0,
                avg_duration_ms: 0.0,
                min_duration_ms: f64::MAX,
                max_duration_ms: 0.0,
                avg_cpu_percent: 0.0,
                peak_memory_bytes: 0,
                failure_count: 0,
            });

        let calls = stats.total_calls as f64;
        stats.avg_duration_ms = (stats.avg_duration_ms * calls + entry.duration_ms) / (calls + 1.0);
        stats.avg_cpu_percent = (stats.avg_cpu_percent * calls + entry.cpu_percent) / (calls + 1.0);
        stats.total_calls += 1;
        stats.min_duration_ms = stats.min_duration_ms.min(entry.duration_ms);
        stats.max_duration_ms = stats.max_duration_ms.max(entry.duration_ms);
        stats.peak_memory_bytes = stats.peak_memory_bytes.max(entry.peak_memory_bytes);
        if !entry.success {
            stats.failure_count += 1;
        }
    }

    let scope_count = entries.len();
    let avg_duration_ms = if scope_count > 0 {
        entries.iter().map(|e| e.duration_ms).sum::<f64>() / scope_count as f64
    } else {
        0.0
    };
    let avg_cpu_percent = if scope_count > 0 {
        entries.iter().map(|e| e.cpu_percent).sum::<f64>() / scope_count as f64
    } else {
        0.0
    };
    let peak_memory_bytes = entries.iter().map(|e| e.peak_memory_bytes).max().unwrap_or(0);

    ProfileReport {
        profile_id: profile_id.to_string(),
        started_at_ms,
        ended_at_ms: chrono::Utc::now().timestamp_millis() as u64,
        scope_count,
        avg_duration_ms,
        avg_cpu_percent,
        peak_memory_bytes,
        per_operation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn profiler() -> Arc<Profiler> {
        Arc::new(Profiler::new(
            Arc::new(SampleBuffer::new(100)),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn scope_records_sample_on_drop() {
        let p = profiler();
        {
            let _scope = p.begin_scope("fast_op");
            thread::sleep(Duration::from_millis(5));
        }

        let snapshot = p.buffer.snapshot("fast_op");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].success);
        assert!(snapshot[0].duration_ms >= 5.0);
        assert_eq!(p.open_scope_count(), 0);
    }

    #[test]
    fn failed_scope_records_unsuccessful_sample() {
        let p = profiler();
        {
            let mut scope = p.begin_scope("flaky_op");
            scope.mark_failed();
        }

        let snapshot = p.buffer.snapshot("flaky_op");
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].success);
    }

    #[test]
    fn cancelled_scope_is_recorded_with_label() {
        let p = profiler();
        {
            let mut scope = p.begin_scope("slow_op");
            scope.cancel();
        }

        let snapshot = p.buffer.snapshot("slow_op");
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].success);
        assert_eq!(
            snapshot[0].labels.get("cancelled").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn panicking_scope_still_records() {
        let p = profiler();
        let cloned = Arc::clone(&p);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scope = cloned.begin_scope("panicky_op");
            panic!("boom");
        }));
        assert!(result.is_err());

        let snapshot = p.buffer.snapshot("panicky_op");
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].success);
    }

    #[test]
    fn session_aggregates_tagged_scopes() {
        let p = profiler();
        p.start_profiling("startup");

        for _ in 0..3 {
            let _scope = p.begin_scope("load_config");
        }
        {
            let mut scope = p.begin_scope("connect_db");
            scope.mark_failed();
        }

        let report = p.stop_profiling("startup").unwrap();
        assert_eq!(report.scope_count, 4);
        assert_eq!(report.per_operation.len(), 2);
        assert_eq!(report.per_operation["load_config"].total_calls, 3);
        assert_eq!(report.per_operation["connect_db"].failure_count, 1);
    }

    #[test]
    fn scopes_opened_before_session_are_not_counted() {
        let p = profiler();
        let early = p.begin_scope("early_op");
        p.start_profiling("late_session");
        drop(early);

        {
            let _scope = p.begin_scope("in_session");
        }

        let report = p.stop_profiling("late_session").unwrap();
        assert_eq!(report.scope_count, 1);
        assert!(report.per_operation.contains_key("in_session"));
    }

    #[test]
    fn stopping_unknown_session_errors() {
        let p = profiler();
        assert!(matches!(
            p.stop_profiling("never_started"),
            Err(PerfError::SessionNotFound(_))
        ));
    }

    #[test]
    fn concurrent_scopes_are_independent() {
        let p = profiler();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _scope = p.begin_scope("parallel_op");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(p.buffer.len("parallel_op"), 100); // capped by buffer capacity
        assert_eq!(p.open_scope_count(), 0);
    }

    #[tokio::test]
    async fn sampling_tick_tracks_open_scopes() {
        let p = Arc::new(Profiler::new(
            Arc::new(SampleBuffer::new(100)),
            Duration::from_millis(10),
        ));
        let tick = p.spawn_sampling_tick();

        let scope = p.begin_scope("long_op");
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(scope);
        tick.abort();

        let snapshot = p.buffer.snapshot("long_op");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].duration_ms >= 50.0);
    }
}
