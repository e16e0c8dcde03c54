//! Repeatable benchmarks graded against numeric targets.
//!
//! The runner executes warmup iterations first, then measures the configured
//! number of calls. Every measured call lands in the shared [`SampleBuffer`]
//! under the benchmark name. Timeouts and target errors become failed
//! samples and a failure rate; they never abort the remaining iterations, so
//! a single flaky call cannot invalidate a whole run. Timeouts use
//! cooperative cancellation (`tokio::time::timeout`), never forced thread
//! termination. Cancelling the run itself records the in-flight iteration
//! as a failed sample with a `cancelled` label rather than dropping it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::BenchmarkDefaults;
use crate::error::{PerfError, Result};
use crate::sample::{Sample, SampleBuffer};
use crate::stats;

/// A benchmark target: an async call returning `Ok(())` on success or an
/// error message on failure. Side-effect isolation is the caller's contract;
/// it is what lets independent suite benchmarks run concurrently.
pub type BenchTarget =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Caller-supplied benchmark parameters. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub name: String,
    pub iterations: usize,
    pub warmup_iterations: usize,
    pub target_avg_ms: f64,
    pub target_p95_ms: f64,
    pub timeout_ms: u64,
}

impl BenchmarkConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iterations: 50,
            warmup_iterations: 5,
            target_avg_ms: 100.0,
            target_p95_ms: 200.0,
            timeout_ms: 5_000,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Rejected at call time, before any measurement begins.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PerfError::InvalidConfig(
                "benchmark name must not be empty".to_string(),
            ));
        }
        if self.iterations == 0 {
            return Err(PerfError::InvalidConfig(format!(
                "benchmark '{}': iterations must be greater than zero",
                self.name
            )));
        }
        if self.target_avg_ms <= 0.0 || self.target_p95_ms <= 0.0 {
            return Err(PerfError::InvalidConfig(format!(
                "benchmark '{}': latency targets must be positive",
                self.name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(PerfError::InvalidConfig(format!(
                "benchmark '{}': timeout_ms must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Letter ranking of how well a run met its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Worst latency overshoot governs: A needs a >=20% margin on both
    /// targets, B means targets met, C/D allow 10%/50% overshoot. A run with
    /// failures cannot grade better than C regardless of latency.
    pub fn evaluate(avg_ms: f64, p95_ms: f64, failure_rate: f64, config: &BenchmarkConfig) -> Self {
        let overshoot = (avg_ms / config.target_avg_ms).max(p95_ms / config.target_p95_ms);
        let latency_grade = if overshoot <= 0.8 {
            Grade::A
        } else if overshoot <= 1.0 {
            Grade::B
        } else if overshoot <= 1.1 {
            Grade::C
        } else if overshoot <= 1.5 {
            Grade::D
        } else {
            Grade::F
        };

        if failure_rate > 0.0 && matches!(latency_grade, Grade::A | Grade::B) {
            Grade::C
        } else {
            latency_grade
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        write!(f, "{letter}")
    }
}

/// Outcome of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub name: String,
    pub config: BenchmarkConfig,
    /// Successful iteration durations in run order.
    pub samples_ms: Vec<f64>,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub failure_count: usize,
    pub failure_rate: f64,
    pub meets_targets: bool,
    pub grade: Grade,
    pub completed_at_ms: u64,
}

impl BenchmarkResult {
    fn from_run(config: BenchmarkConfig, samples_ms: Vec<f64>, failure_count: usize) -> Self {
        let mut sorted = samples_ms.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let avg_ms = stats::mean(&sorted);
        let p95_ms = stats::percentile_nearest_rank(&sorted, 95.0);
        let failure_rate = failure_count as f64 / config.iterations as f64;
        let meets_targets = avg_ms <= config.target_avg_ms
            && p95_ms <= config.target_p95_ms
            && failure_rate == 0.0
            && !sorted.is_empty();
        let grade = Grade::evaluate(avg_ms, p95_ms, failure_rate, &config);

        Self {
            name: config.name.clone(),
            config,
            samples_ms,
            avg_ms,
            p95_ms,
            failure_count,
            failure_rate,
            meets_targets,
            grade,
            completed_at_ms: chrono::Utc::now().timestamp_millis() as u64,
        }
    }
}

/// A named collection of benchmarks to run as one suite.
#[derive(Default)]
pub struct BenchmarkSuite {
    benchmarks: Vec<(BenchmarkConfig, BenchTarget)>,
}

impl BenchmarkSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: BenchmarkConfig, target: BenchTarget) -> &mut Self {
        self.benchmarks.push((config, target));
        self
    }

    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }
}

/// Records a cancelled sample if the surrounding future is dropped before
/// the iteration resolves, so an externally cancelled run never loses its
/// in-flight measurement.
struct IterationGuard {
    buffer: Arc<SampleBuffer>,
    name: String,
    started: Instant,
    armed: bool,
}

impl IterationGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for IterationGuard {
    fn drop(&mut self) {
        if self.armed {
            let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            self.buffer.record(
                Sample::timed(&self.name, elapsed_ms)
                    .failed()
                    .with_label("cancelled", "true"),
            );
        }
    }
}

pub struct BenchmarkRunner {
    buffer: Arc<SampleBuffer>,
    history: Mutex<FxHashMap<String, VecDeque<BenchmarkResult>>>,
    history_size: usize,
    max_concurrency: usize,
}

impl BenchmarkRunner {
    pub fn new(buffer: Arc<SampleBuffer>, defaults: &BenchmarkDefaults) -> Self {
        Self {
            buffer,
            history: Mutex::new(FxHashMap::default()),
            history_size: defaults.history_size.max(1),
            max_concurrency: defaults.max_concurrency.max(1),
        }
    }

    /// Run one benchmark: warmups discarded, then `iterations` measured
    /// calls. Panics inside the target are caught and folded into the
    /// failure rate like any other failed iteration.
    pub async fn run_benchmark(
        &self,
        config: &BenchmarkConfig,
        target: BenchTarget,
    ) -> Result<BenchmarkResult> {
        config.validate()?;

        for _ in 0..config.warmup_iterations {
            let warmup = std::panic::AssertUnwindSafe(target()).catch_unwind();
            let _ = tokio::time::timeout(config.timeout(), warmup).await;
        }

        let mut durations = Vec::with_capacity(config.iterations);
        let mut failures = 0usize;

        for _ in 0..config.iterations {
            let call = std::panic::AssertUnwindSafe(target()).catch_unwind();
            let started = Instant::now();
            let mut guard = IterationGuard {
                buffer: Arc::clone(&self.buffer),
                name: config.name.clone(),
                started,
                armed: true,
            };
            let outcome = tokio::time::timeout(config.timeout(), call).await;
            guard.disarm();
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(Ok(Ok(()))) => {
                    durations.push(elapsed_ms);
                    self.buffer.record(Sample::timed(&config.name, elapsed_ms));
                }
                Ok(Ok(Err(err))) => {
                    failures += 1;
                    debug!("benchmark '{}' iteration failed: {}", config.name, err);
                    self.buffer.record(
                        Sample::timed(&config.name, elapsed_ms)
                            .failed()
                            .with_label("error", err),
                    );
                }
                Ok(Err(_panic)) => {
                    failures += 1;
                    warn!("benchmark '{}' iteration panicked", config.name);
                    self.buffer.record(
                        Sample::timed(&config.name, elapsed_ms)
                            .failed()
                            .with_label("error", "panic"),
                    );
                }
                Err(_) => {
                    failures += 1;
                    let err = PerfError::Timeout(config.timeout());
                    debug!("benchmark '{}': {}", config.name, err);
                    self.buffer.record(
                        Sample::timed(&config.name, elapsed_ms)
                            .failed()
                            .with_label("timeout", "true"),
                    );
                }
            }
        }

        let result = BenchmarkResult::from_run(config.clone(), durations, failures);
        info!(
            "benchmark '{}' complete: avg {:.2}ms p95 {:.2}ms failures {} grade {}",
            result.name, result.avg_ms, result.p95_ms, result.failure_count, result.grade
        );
        self.push_history(result.clone());
        Ok(result)
    }

    /// Execute a suite under a bounded worker pool. Every config is
    /// validated before any benchmark starts.
    pub async fn run_suite(
        self: &Arc<Self>,
        suite: BenchmarkSuite,
    ) -> Result<FxHashMap<String, BenchmarkResult>> {
        for (config, _) in &suite.benchmarks {
            config.validate()?;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        for (config, target) in suite.benchmarks {
            let runner = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("suite semaphore closed");
                let result = runner.run_benchmark(&config, target).await;
                (config.name, result)
            });
        }

        let mut results = FxHashMap::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(result))) => {
                    results.insert(name, result);
                }
                Ok((_, Err(err))) => return Err(err),
                Err(err) => warn!("benchmark task failed to join: {}", err),
            }
        }
        Ok(results)
    }

    fn push_history(&self, result: BenchmarkResult) {
        let mut history = self.history.lock().unwrap();
        let ring = history.entry(result.name.clone()).or_default();
        while ring.len() >= self.history_size {
            ring.pop_front();
        }
        ring.push_back(result);
    }

    /// Retained past results for one benchmark, oldest first.
    pub fn history(&self, name: &str) -> Vec<BenchmarkResult> {
        self.history
            .lock()
            .unwrap()
            .get(name)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names with retained history, sorted.
    pub fn benchmark_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.history.lock().unwrap().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}
