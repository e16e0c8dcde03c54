//! End-to-end demo: profile an operation, benchmark it, freeze a baseline,
//! inject a slowdown, detect the regression, and print an optimization plan.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use perf_engine::{
    BenchTarget, BenchmarkConfig, Collaborators, EngineConfig, PerfEngine, PlanConstraints,
    PrometheusMetricSink, Sample, ServiceMetrics,
};
use perf_engine::logging::{init_dual_logging, LoggingConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_dual_logging(&LoggingConfig::default())?;

    let sink = Arc::new(PrometheusMetricSink::new());
    let engine = PerfEngine::with_collaborators(
        EngineConfig::default(),
        Collaborators {
            metric_sink: Some(sink.clone()),
            ..Collaborators::default()
        },
    )?;

    println!("🔬 Profiling a scoped operation");
    {
        let _scope = engine.begin_scope("render_report");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let snapshot = engine.buffer().snapshot("render_report");
    println!(
        "   recorded {} sample(s), first duration {:.2}ms",
        snapshot.len(),
        snapshot[0].duration_ms
    );

    println!("\n📊 Benchmarking");
    let target: BenchTarget = Arc::new(|| {
        async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        }
        .boxed()
    });
    let mut config = BenchmarkConfig::new("sleepy_op");
    config.iterations = 40;
    config.warmup_iterations = 5;
    config.target_avg_ms = 20.0;
    config.target_p95_ms = 30.0;
    let result = engine.run_benchmark(&config, target).await?;
    println!(
        "   avg {:.2}ms p95 {:.2}ms grade {} (targets met: {})",
        result.avg_ms, result.p95_ms, result.grade, result.meets_targets
    );

    println!("\n📈 Baseline + regression check");
    for i in 0..40 {
        engine
            .buffer()
            .record(Sample::timed("checkout", 100.0 + (i % 9) as f64));
    }
    engine.create_baseline_from_buffer("checkout")?;
    engine.buffer().reset("checkout");
    for i in 0..20 {
        engine
            .buffer()
            .record(Sample::timed("checkout", 210.0 + (i % 9) as f64));
    }
    let report = engine.detect_regression_from_buffer("checkout")?;
    println!(
        "   regression={} severity={:?} confidence={:.3}",
        report.has_regression, report.severity, report.confidence
    );

    println!("\n🧭 Optimization plan");
    let metrics = ServiceMetrics {
        cpu_utilization_percent: 88.0,
        memory_utilization_percent: 60.0,
        cache_hit_rate: 0.55,
        avg_latency_ms: 140.0,
        error_rate: 0.02,
    };
    let recommendations =
        engine
            .optimizer()
            .analyze_service_performance("checkout-svc", "service", &metrics);
    let plan = engine.optimizer().generate_plan(
        &recommendations,
        &PlanConstraints {
            max_recommendations: 5,
            max_total_effort_hours: 24.0,
            prioritize_quick_wins: true,
        },
    );
    for rec in &plan.selected {
        println!(
            "   [{}h, ${:.0}/mo, {:?}] {}",
            rec.estimated_effort_hours, rec.estimated_monthly_gain_usd, rec.risk_level, rec.title
        );
    }
    println!(
        "   total: {:.0}h effort, ${:.0}/mo estimated gain",
        plan.total_effort_hours, plan.total_estimated_gain_usd
    );

    println!("\n📤 Prometheus exposition (truncated)");
    let exported = sink.export();
    for line in exported.lines().take(8) {
        println!("   {line}");
    }

    info!("demo complete, shutting engine down");
    engine.shutdown();
    Ok(())
}
