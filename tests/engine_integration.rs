//! End-to-end flow through the public engine API: profiled work fills the
//! shared buffer, a baseline is frozen, a slowdown is detected, the monitor
//! publishes and alerts, and the optimizer folds everything into a plan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use perf_engine::{
    AlertHandle, AlertSink, AlertSpec, BenchTarget, BenchmarkConfig, BenchmarkSuite, Collaborators,
    Comparison, CostSource, EngineConfig, IncidentSeverity, MetricSink, PerfEngine,
    PlanConstraints, RegressionSeverity, Result, Sample, ServiceMetrics, ThresholdRule,
};

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, f64)>>,
}

impl MetricSink for RecordingSink {
    fn publish_metric(&self, name: &str, value: f64, _labels: &HashMap<String, String>) {
        self.published
            .lock()
            .unwrap()
            .push((name.to_string(), value));
    }
}

#[derive(Default)]
struct RecordingAlertSink {
    alerts: Mutex<Vec<AlertSpec>>,
}

impl AlertSink for RecordingAlertSink {
    fn create_alert(&self, alert: &AlertSpec) -> Result<AlertHandle> {
        let mut alerts = self.alerts.lock().unwrap();
        alerts.push(alert.clone());
        Ok(AlertHandle {
            id: format!("alert-{}", alerts.len()),
        })
    }
}

struct FixedCost(f64);

impl CostSource for FixedCost {
    fn monthly_cost_usd(&self, _service: &str) -> Option<f64> {
        Some(self.0)
    }
}

fn quiet_config() -> EngineConfig {
    EngineConfig {
        enable_background_tasks: false,
        ..EngineConfig::default()
    }
}

fn engine_with_recorders() -> (PerfEngine, Arc<RecordingSink>, Arc<RecordingAlertSink>) {
    let sink = Arc::new(RecordingSink::default());
    let alert_sink = Arc::new(RecordingAlertSink::default());
    let engine = PerfEngine::with_collaborators(
        quiet_config(),
        Collaborators {
            metric_sink: Some(sink.clone()),
            alert_sink: Some(alert_sink.clone()),
            cost_source: Some(Arc::new(FixedCost(1000.0))),
        },
    )
    .unwrap();
    (engine, sink, alert_sink)
}

#[tokio::test]
async fn regression_flows_from_buffer_to_alerts_and_plan() {
    let (engine, sink, alert_sink) = engine_with_recorders();

    // Historical behavior: ~100ms with modest spread.
    for i in 0..40 {
        engine
            .buffer()
            .record(Sample::timed("checkout", 95.0 + (i % 11) as f64));
    }
    let baseline = engine.create_baseline_from_buffer("checkout").unwrap();
    assert_eq!(baseline.sample_count, 40);

    // The service slows down to ~200ms.
    engine.buffer().reset("checkout");
    for i in 0..20 {
        engine
            .buffer()
            .record(Sample::timed("checkout", 195.0 + (i % 11) as f64));
    }

    let report = engine.detect_regression_from_buffer("checkout").unwrap();
    assert!(report.has_regression);
    assert_eq!(report.severity, RegressionSeverity::Severe);
    assert!(report.confidence > 0.95);

    // The monitor published the derived metrics and raised a critical alert.
    let published = sink.published.lock().unwrap();
    assert!(published
        .iter()
        .any(|(name, _)| name == "operation_mean_change_percent"));
    assert!(published
        .iter()
        .any(|(name, _)| name == "operation_regression_confidence"));
    drop(published);

    let alerts = alert_sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].condition.contains("checkout"));
    drop(alerts);

    let incidents = engine.monitor().incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, IncidentSeverity::Critical);

    // The optimizer picked the regression up and ranks it into a plan.
    let recs = engine.optimizer().analyze_service_performance(
        "shop",
        "service",
        &ServiceMetrics {
            cpu_utilization_percent: 50.0,
            memory_utilization_percent: 50.0,
            cache_hit_rate: 0.9,
            avg_latency_ms: 200.0,
            error_rate: 0.0,
        },
    );
    assert!(recs.iter().any(|r| r.id == "shop-regression-checkout"));

    let plan = engine.optimizer().generate_plan(
        &recs,
        &PlanConstraints {
            max_recommendations: 3,
            max_total_effort_hours: 40.0,
            prioritize_quick_wins: false,
        },
    );
    assert!(plan
        .selected
        .iter()
        .any(|r| r.id == "shop-regression-checkout"));
    assert!(plan.total_effort_hours <= 40.0);
}

#[tokio::test]
async fn benchmark_samples_feed_baselines() {
    let engine = PerfEngine::new(quiet_config()).unwrap();

    let target: BenchTarget = Arc::new(|| {
        async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(())
        }
        .boxed()
    });
    let mut config = BenchmarkConfig::new("hot_path");
    config.iterations = 30;
    config.warmup_iterations = 2;

    let result = engine.run_benchmark(&config, target).await.unwrap();
    assert!(result.meets_targets);
    assert_eq!(engine.buffer().len("hot_path"), 30);

    // The measured samples are enough to freeze a baseline right away.
    let baseline = engine.create_baseline_from_buffer("hot_path").unwrap();
    assert_eq!(baseline.sample_count, 30);
    assert!(baseline.mean_ms >= 1.0);
}

#[tokio::test]
async fn suite_results_land_in_shared_history() {
    let engine = PerfEngine::new(quiet_config()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut suite = BenchmarkSuite::new();
    for name in ["parse", "encode"] {
        let counter = Arc::clone(&calls);
        let target: BenchTarget = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        });
        let mut config = BenchmarkConfig::new(name);
        config.iterations = 5;
        config.warmup_iterations = 0;
        suite.register(config, target);
    }

    let results = engine.run_suite(suite).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(engine.buffer().len("parse"), 5);
    assert_eq!(engine.buffer().len("encode"), 5);
}

#[tokio::test]
async fn profiling_session_summarizes_scoped_work() {
    let engine = PerfEngine::new(quiet_config()).unwrap();
    engine.profiler().start_profiling("request_cycle");

    for _ in 0..3 {
        let _scope = engine.begin_scope("parse_request");
    }
    {
        let mut scope = engine.begin_scope("write_response");
        scope.mark_failed();
    }

    let report = engine.profiler().stop_profiling("request_cycle").unwrap();
    assert_eq!(report.scope_count, 4);
    assert_eq!(report.per_operation["parse_request"].total_calls, 3);
    assert_eq!(report.per_operation["write_response"].failure_count, 1);

    // Scopes also landed in the shared buffer for later baselining.
    assert_eq!(engine.buffer().len("parse_request"), 3);
    assert_eq!(engine.buffer().len("write_response"), 1);
}

#[tokio::test]
async fn threshold_rules_fire_through_the_engine_monitor() {
    let (engine, _sink, alert_sink) = engine_with_recorders();
    engine.monitor().add_rule(ThresholdRule {
        metric: "error_rate".to_string(),
        comparison: Comparison::Above,
        threshold: 0.05,
        severity: IncidentSeverity::Warning,
    });

    assert!(engine
        .monitor()
        .observe("error_rate", 0.01, &HashMap::new())
        .is_empty());
    let fired = engine
        .monitor()
        .observe("error_rate", 0.12, &HashMap::new());
    assert_eq!(fired.len(), 1);
    assert_eq!(alert_sink.alerts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn background_tasks_sweep_and_shut_down() {
    let mut config = EngineConfig::default();
    config.profiler.sampling_interval_ms = 10;
    let engine = PerfEngine::new(config).unwrap();

    // A long-running scope observed across several sampling ticks.
    let scope = engine.begin_scope("long_haul");
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(scope);

    let snapshot = engine.buffer().snapshot("long_haul");
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].duration_ms >= 50.0);

    engine.shutdown();
}
