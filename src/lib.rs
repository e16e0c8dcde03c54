//! In-process performance observability and optimization engine.
//!
//! The engine samples runtime performance of named operations, compares new
//! samples against statistically derived baselines to detect regressions,
//! runs repeatable benchmarks against numeric targets, and synthesizes
//! ranked optimization recommendations from all of the above.
//!
//! Everything hangs off an explicit [`PerfEngine`] context: no ambient
//! global state, so parallel tests get isolated engines. Background tasks
//! (the profiler's sampling tick and the recommendation cache sweep) are
//! owned by the engine and aborted on [`PerfEngine::shutdown`].

pub mod benchmark;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod optimizer;
pub mod profiler;
pub mod regression;
pub mod sample;
pub(crate) mod stats;

use std::sync::{Arc, Mutex};

pub use benchmark::{BenchTarget, BenchmarkConfig, BenchmarkResult, BenchmarkRunner, BenchmarkSuite, Grade};
pub use cache::{AdaptiveCache, CachePerformanceReport, SecretCache, SecretProvider};
pub use config::EngineConfig;
pub use error::{PerfError, Result};
pub use monitor::{
    AlertHandle, AlertSink, AlertSpec, Comparison, Incident, IncidentSeverity, MetricMonitor,
    MetricSink, PrometheusMetricSink, ThresholdRule, TracingMetricSink,
};
pub use optimizer::{
    CostSource, OptimizationEngine, OptimizationPlan, OptimizationRecommendation, PlanConstraints,
    RiskLevel, ServiceMetrics,
};
pub use profiler::{OperationStats, ProfileReport, Profiler, ScopeGuard};
pub use regression::{Baseline, RegressionDetector, RegressionReport, RegressionSeverity};
pub use sample::{Sample, SampleBuffer};

use rustc_hash::FxHashMap;

/// External collaborators wired into the engine at construction. All
/// optional; defaults are a log-only metric sink, no alerting, and no
/// billing data.
#[derive(Default)]
pub struct Collaborators {
    pub metric_sink: Option<Arc<dyn MetricSink>>,
    pub alert_sink: Option<Arc<dyn AlertSink>>,
    pub cost_source: Option<Arc<dyn CostSource>>,
}

/// The engine context: one shared sample buffer plus the components that
/// read and write it.
pub struct PerfEngine {
    config: EngineConfig,
    buffer: Arc<SampleBuffer>,
    profiler: Arc<Profiler>,
    runner: Arc<BenchmarkRunner>,
    detector: Arc<RegressionDetector>,
    monitor: Arc<MetricMonitor>,
    optimizer: Arc<OptimizationEngine>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PerfEngine {
    /// Construct an engine with default collaborators.
    ///
    /// Must run inside a tokio runtime when `enable_background_tasks` is
    /// set, since construction spawns the sampling tick and cache sweep.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let buffer = Arc::new(SampleBuffer::new(config.buffer.capacity));
        let profiler = Arc::new(Profiler::new(
            Arc::clone(&buffer),
            config.profiler.sampling_interval(),
        ));
        let runner = Arc::new(BenchmarkRunner::new(Arc::clone(&buffer), &config.benchmark));
        let detector = Arc::new(RegressionDetector::new(config.regression.clone()));

        let metric_sink = collaborators
            .metric_sink
            .unwrap_or_else(|| Arc::new(TracingMetricSink));
        let mut monitor = MetricMonitor::new(metric_sink, config.monitor.incident_history);
        if let Some(alert_sink) = collaborators.alert_sink {
            monitor = monitor.with_alert_sink(alert_sink);
        }
        let monitor = Arc::new(monitor);

        let optimizer = Arc::new(OptimizationEngine::new(
            Arc::clone(&runner),
            collaborators.cost_source,
            &config.optimizer,
        ));

        let engine = Self {
            buffer,
            profiler,
            runner,
            detector,
            monitor,
            optimizer,
            background: Mutex::new(Vec::new()),
            config,
        };
        if engine.config.enable_background_tasks {
            engine.start_background_tasks();
        }
        Ok(engine)
    }

    fn start_background_tasks(&self) {
        let mut handles = self.background.lock().unwrap();
        handles.push(self.profiler.spawn_sampling_tick());
        handles.push(
            self.optimizer
                .spawn_cache_sweeper(self.config.cache.sweep_interval()),
        );
        tracing::debug!("engine background tasks started");
    }

    /// Abort all background tasks. Called automatically on drop.
    pub fn shutdown(&self) {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<SampleBuffer> {
        &self.buffer
    }

    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    pub fn detector(&self) -> &Arc<RegressionDetector> {
        &self.detector
    }

    pub fn monitor(&self) -> &Arc<MetricMonitor> {
        &self.monitor
    }

    pub fn optimizer(&self) -> &Arc<OptimizationEngine> {
        &self.optimizer
    }

    /// Open an RAII measurement scope around a unit of work.
    pub fn begin_scope(&self, operation: impl Into<String>) -> ScopeGuard {
        self.profiler.begin_scope(operation)
    }

    /// Run one benchmark; samples land in the shared buffer under the
    /// config's name.
    pub async fn run_benchmark(
        &self,
        config: &BenchmarkConfig,
        target: BenchTarget,
    ) -> Result<BenchmarkResult> {
        self.runner.run_benchmark(config, target).await
    }

    /// Run a suite under the configured bounded worker pool.
    pub async fn run_suite(
        &self,
        suite: BenchmarkSuite,
    ) -> Result<FxHashMap<String, BenchmarkResult>> {
        self.runner.run_suite(suite).await
    }

    /// Snapshot the buffer for `operation` and freeze a baseline from it.
    pub fn create_baseline_from_buffer(&self, operation: &str) -> Result<Baseline> {
        let samples = self.buffer.snapshot(operation);
        self.detector.create_baseline(operation, &samples)
    }

    /// Detect a regression from the buffer's current contents, publish the
    /// derived metrics, and feed the report to the optimizer.
    pub fn detect_regression_from_buffer(&self, operation: &str) -> Result<RegressionReport> {
        let samples = self.buffer.snapshot(operation);
        let report = self.detector.detect_regression(operation, &samples)?;
        self.monitor.report_regression(&report);
        self.optimizer.record_regression(report.clone());
        Ok(report)
    }
}

impl Drop for PerfEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
