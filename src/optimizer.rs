//! Rule-based optimization recommendations and plan selection.
//!
//! The engine folds together live service metrics, recent regression
//! reports, benchmark trend history, and cache hit-rate accounting into a
//! ranked list of recommendations. Ranking is a total order: estimated gain
//! descending, ties broken by id, so repeated analyses of the same inputs
//! produce identical output. Plan selection is a greedy knapsack over the
//! effort budget.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::benchmark::BenchmarkRunner;
use crate::cache::AdaptiveCache;
use crate::config::OptimizerConfig;
use crate::regression::{RegressionReport, RegressionSeverity};

/// External billing collaborator: monthly spend per service, used only as a
/// scoring input.
pub trait CostSource: Send + Sync {
    fn monthly_cost_usd(&self, service: &str) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub id: String,
    pub title: String,
    pub category: String,
    pub estimated_effort_hours: f64,
    pub estimated_monthly_gain_usd: f64,
    pub risk_level: RiskLevel,
    pub rationale: String,
    pub prerequisite_ids: Vec<String>,
}

/// Live resource/efficiency metrics for one service, supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub cpu_utilization_percent: f64,
    pub memory_utilization_percent: f64,
    /// 0..1; below 0.70 triggers caching recommendations.
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
    /// 0..1.
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConstraints {
    pub max_recommendations: usize,
    pub max_total_effort_hours: f64,
    /// Sort by effort ascending first, so cheap items fill the budget.
    pub prioritize_quick_wins: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub selected: Vec<OptimizationRecommendation>,
    pub total_effort_hours: f64,
    pub total_estimated_gain_usd: f64,
    /// Ids considered but not selected (budget, count, or prerequisites).
    pub skipped_ids: Vec<String>,
}

/// Fallback monthly spend when no cost source is wired in, so gain scoring
/// still produces a usable ordering.
const DEFAULT_MONTHLY_COST_USD: f64 = 500.0;

const CACHE_HIT_RATE_FLOOR: f64 = 0.70;
const CPU_PRESSURE_PERCENT: f64 = 80.0;
const MEMORY_PRESSURE_PERCENT: f64 = 85.0;
const ERROR_RATE_FLOOR: f64 = 0.01;

pub struct OptimizationEngine {
    runner: Arc<BenchmarkRunner>,
    cost_source: Option<Arc<dyn CostSource>>,
    recent_regressions: Mutex<FxHashMap<String, RegressionReport>>,
    recommendation_cache: Arc<AdaptiveCache<Vec<OptimizationRecommendation>>>,
    recommendation_ttl: Duration,
}

impl OptimizationEngine {
    pub fn new(
        runner: Arc<BenchmarkRunner>,
        cost_source: Option<Arc<dyn CostSource>>,
        config: &OptimizerConfig,
    ) -> Self {
        Self {
            runner,
            cost_source,
            recent_regressions: Mutex::new(FxHashMap::default()),
            recommendation_cache: Arc::new(AdaptiveCache::new(
                config.recommendation_cache_entries,
            )),
            recommendation_ttl: config.recommendation_ttl(),
        }
    }

    /// Feed a regression report into future analyses. The latest report per
    /// operation supersedes earlier ones, so periodic re-detection of the
    /// same regression never stacks duplicates. Invalidates memoized
    /// analyses since their inputs just changed.
    pub fn record_regression(&self, report: RegressionReport) {
        if report.has_regression {
            self.recent_regressions
                .lock()
                .unwrap()
                .insert(report.operation.clone(), report);
            self.recommendation_cache.invalidate_by_tag("recommendations");
        }
    }

    /// Start the memoization cache's expiry sweep; owned by the engine
    /// lifecycle.
    pub fn spawn_cache_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.recommendation_cache.spawn_sweeper(interval)
    }

    /// Produce ranked recommendations for one service. Results are memoized
    /// briefly per (service, type) since analysis inputs change slowly.
    pub fn analyze_service_performance(
        &self,
        service: &str,
        service_type: &str,
        metrics: &ServiceMetrics,
    ) -> Vec<OptimizationRecommendation> {
        let cache_key = format!("{service}/{service_type}");
        if let Some(cached) = self.recommendation_cache.get(&cache_key) {
            debug!("analysis cache hit for {}", cache_key);
            return cached;
        }

        let monthly_cost = self
            .cost_source
            .as_ref()
            .and_then(|source| source.monthly_cost_usd(service))
            .unwrap_or(DEFAULT_MONTHLY_COST_USD);

        let mut recommendations = Vec::new();
        self.metric_rules(service, service_type, metrics, monthly_cost, &mut recommendations);
        self.regression_rules(service, monthly_cost, &mut recommendations);
        self.trend_rules(service, monthly_cost, &mut recommendations);

        // Total order: gain descending, ties by id.
        recommendations.sort_by(|a, b| {
            b.estimated_monthly_gain_usd
                .total_cmp(&a.estimated_monthly_gain_usd)
                .then_with(|| a.id.cmp(&b.id))
        });

        info!(
            "analysis of '{}' ({}) produced {} recommendations",
            service,
            service_type,
            recommendations.len()
        );
        self.recommendation_cache.set(
            cache_key,
            recommendations.clone(),
            self.recommendation_ttl,
            &["recommendations"],
        );
        recommendations
    }

    fn metric_rules(
        &self,
        service: &str,
        service_type: &str,
        metrics: &ServiceMetrics,
        monthly_cost: f64,
        out: &mut Vec<OptimizationRecommendation>,
    ) {
        if metrics.cache_hit_rate < CACHE_HIT_RATE_FLOOR {
            let miss_reduction = CACHE_HIT_RATE_FLOOR - metrics.cache_hit_rate;
            out.push(OptimizationRecommendation {
                id: format!("{service}-cache-tuning"),
                title: format!("Increase cache TTL/capacity for {service}"),
                category: "caching".to_string(),
                estimated_effort_hours: 4.0,
                estimated_monthly_gain_usd: miss_reduction * monthly_cost,
                risk_level: RiskLevel::Low,
                rationale: format!(
                    "Cache hit rate is {:.0}%, below the {:.0}% floor; each avoided miss \
                     saves recomputation and backend load",
                    metrics.cache_hit_rate * 100.0,
                    CACHE_HIT_RATE_FLOOR * 100.0
                ),
                prerequisite_ids: Vec::new(),
            });
        }

        if metrics.cpu_utilization_percent > CPU_PRESSURE_PERCENT {
            let profiling_id = format!("{service}-continuous-profiling");
            out.push(OptimizationRecommendation {
                id: profiling_id.clone(),
                title: format!("Enable continuous profiling on {service}"),
                category: "observability".to_string(),
                estimated_effort_hours: 2.0,
                estimated_monthly_gain_usd: monthly_cost * 0.01,
                risk_level: RiskLevel::Low,
                rationale: "Hotspot work needs per-operation CPU attribution first".to_string(),
                prerequisite_ids: Vec::new(),
            });
            out.push(OptimizationRecommendation {
                id: format!("{service}-cpu-hotspots"),
                title: format!("Optimize CPU hotspots in {service}"),
                category: "compute".to_string(),
                estimated_effort_hours: 12.0,
                estimated_monthly_gain_usd: monthly_cost
                    * ((metrics.cpu_utilization_percent - CPU_PRESSURE_PERCENT) / 100.0),
                risk_level: RiskLevel::Medium,
                rationale: format!(
                    "CPU utilization is {:.0}%, above the {:.0}% pressure line",
                    metrics.cpu_utilization_percent, CPU_PRESSURE_PERCENT
                ),
                prerequisite_ids: vec![profiling_id],
            });
        }

        if metrics.memory_utilization_percent > MEMORY_PRESSURE_PERCENT {
            out.push(OptimizationRecommendation {
                id: format!("{service}-memory-pressure"),
                title: format!("Reduce memory footprint of {service}"),
                category: "memory".to_string(),
                estimated_effort_hours: 8.0,
                estimated_monthly_gain_usd: monthly_cost
                    * ((metrics.memory_utilization_percent - MEMORY_PRESSURE_PERCENT) / 100.0),
                risk_level: RiskLevel::Medium,
                rationale: format!(
                    "Memory utilization is {:.0}%, above the {:.0}% pressure line",
                    metrics.memory_utilization_percent, MEMORY_PRESSURE_PERCENT
                ),
                prerequisite_ids: Vec::new(),
            });
        }

        if metrics.error_rate > ERROR_RATE_FLOOR {
            out.push(OptimizationRecommendation {
                id: format!("{service}-error-burndown"),
                title: format!("Burn down the error rate of {service}"),
                category: "reliability".to_string(),
                estimated_effort_hours: 16.0,
                estimated_monthly_gain_usd: monthly_cost * metrics.error_rate,
                risk_level: RiskLevel::Medium,
                rationale: format!(
                    "Error rate is {:.2}%; retries and failures burn capacity",
                    metrics.error_rate * 100.0
                ),
                prerequisite_ids: Vec::new(),
            });
        }

        if service_type == "database" && metrics.avg_latency_ms > 500.0 {
            out.push(OptimizationRecommendation {
                id: format!("{service}-query-tuning"),
                title: format!("Tune slow queries on {service}"),
                category: "database".to_string(),
                estimated_effort_hours: 10.0,
                estimated_monthly_gain_usd: monthly_cost * 0.15,
                risk_level: RiskLevel::Medium,
                rationale: format!(
                    "Average latency {:.0}ms suggests missing indexes or oversized scans",
                    metrics.avg_latency_ms
                ),
                prerequisite_ids: Vec::new(),
            });
        }

        let combined_utilization =
            metrics.cpu_utilization_percent.max(metrics.memory_utilization_percent);
        if combined_utilization < 30.0 && monthly_cost > 100.0 {
            out.push(OptimizationRecommendation {
                id: format!("{service}-rightsizing"),
                title: format!("Rightsize the {service} footprint"),
                category: "cost".to_string(),
                estimated_effort_hours: 6.0,
                estimated_monthly_gain_usd: monthly_cost * ((50.0 - combined_utilization) / 100.0),
                risk_level: RiskLevel::Low,
                rationale: format!(
                    "Peak utilization is {:.0}% against ${:.0}/month of provisioned capacity",
                    combined_utilization, monthly_cost
                ),
                prerequisite_ids: Vec::new(),
            });
        }
    }

    fn regression_rules(
        &self,
        service: &str,
        monthly_cost: f64,
        out: &mut Vec<OptimizationRecommendation>,
    ) {
        for report in self.recent_regressions.lock().unwrap().values() {
            let (effort, risk) = match report.severity {
                RegressionSeverity::Severe => (8.0, RiskLevel::High),
                RegressionSeverity::Moderate => (6.0, RiskLevel::Medium),
                _ => continue,
            };
            out.push(OptimizationRecommendation {
                id: format!("{service}-regression-{}", report.operation),
                title: format!("Investigate latency regression in '{}'", report.operation),
                category: "regression".to_string(),
                estimated_effort_hours: effort,
                // Gain scored from the regression magnitude so ranking stays
                // a pure (gain, id) order.
                estimated_monthly_gain_usd: monthly_cost * report.mean_change_percent / 100.0,
                risk_level: risk,
                rationale: format!(
                    "Mean latency of '{}' rose {:.0}% over baseline (confidence {:.2})",
                    report.operation, report.mean_change_percent, report.confidence
                ),
                prerequisite_ids: Vec::new(),
            });
        }
    }

    fn trend_rules(
        &self,
        service: &str,
        monthly_cost: f64,
        out: &mut Vec<OptimizationRecommendation>,
    ) {
        for name in self.runner.benchmark_names() {
            let history = self.runner.history(&name);
            let (Some(first), Some(last)) = (history.first(), history.last()) else {
                continue;
            };
            if history.len() < 3 || first.avg_ms <= 0.0 {
                continue;
            }
            let drift = (last.avg_ms - first.avg_ms) / first.avg_ms;
            if drift > 0.20 {
                out.push(OptimizationRecommendation {
                    id: format!("{service}-bench-trend-{name}"),
                    title: format!("Benchmark '{name}' is trending slower"),
                    category: "regression".to_string(),
                    estimated_effort_hours: 4.0,
                    estimated_monthly_gain_usd: monthly_cost * drift * 0.1,
                    risk_level: RiskLevel::Low,
                    rationale: format!(
                        "Average went from {:.2}ms to {:.2}ms across the last {} runs",
                        first.avg_ms,
                        last.avg_ms,
                        history.len()
                    ),
                    prerequisite_ids: Vec::new(),
                });
            }
        }
    }

    /// Greedy knapsack over the effort budget. A candidate is only accepted
    /// once all of its prerequisites are in the plan.
    pub fn generate_plan(
        &self,
        recommendations: &[OptimizationRecommendation],
        constraints: &PlanConstraints,
    ) -> OptimizationPlan {
        fn ratio(rec: &OptimizationRecommendation) -> f64 {
            rec.estimated_monthly_gain_usd / rec.estimated_effort_hours.max(0.25)
        }

        let mut ordered: Vec<&OptimizationRecommendation> = recommendations.iter().collect();
        if constraints.prioritize_quick_wins {
            ordered.sort_by(|a, b| {
                a.estimated_effort_hours
                    .total_cmp(&b.estimated_effort_hours)
                    .then_with(|| ratio(b).total_cmp(&ratio(a)))
                    .then_with(|| a.id.cmp(&b.id))
            });
        } else {
            ordered.sort_by(|a, b| {
                ratio(b)
                    .total_cmp(&ratio(a))
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        let mut selected: Vec<OptimizationRecommendation> = Vec::new();
        let mut skipped_ids = Vec::new();
        let mut total_effort = 0.0;
        let mut total_gain = 0.0;

        for rec in ordered {
            if selected.len() >= constraints.max_recommendations
                || total_effort + rec.estimated_effort_hours > constraints.max_total_effort_hours
                || !rec
                    .prerequisite_ids
                    .iter()
                    .all(|p| selected.iter().any(|s| &s.id == p))
            {
                skipped_ids.push(rec.id.clone());
                continue;
            }
            total_effort += rec.estimated_effort_hours;
            total_gain += rec.estimated_monthly_gain_usd;
            selected.push(rec.clone());
        }

        OptimizationPlan {
            selected,
            total_effort_hours: total_effort,
            total_estimated_gain_usd: total_gain,
            skipped_ids,
        }
    }
}
