//! Statistical regression detection against stored baselines.
//!
//! A baseline is a frozen summary of historical durations for one operation.
//! Detection runs a two-sample z-test of the current samples against the
//! baseline; a regression is flagged only when the shift is both
//! statistically significant (z above threshold) and practically meaningful
//! (relative mean increase above the effect-size floor). The dual condition
//! keeps negligible-but-"significant" drift from paging anyone.
//!
//! The z-test approximation assumes reasonably sized sample sets; the
//! minimum baseline/current sizes below enforce that.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RegressionConfig;
use crate::error::{PerfError, Result};
use crate::sample::Sample;
use crate::stats;

/// Frozen statistical summary of historical performance for one operation.
/// Superseded by recomputation, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub operation: String,
    pub created_at: DateTime<Utc>,
    pub sample_count: usize,
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionSeverity {
    None,
    Minor,
    Moderate,
    Severe,
}

/// Summary statistics of the samples under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStats {
    pub sample_count: usize,
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub p95_ms: f64,
}

/// Outcome of one detection call. Not persisted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionReport {
    pub operation: String,
    pub baseline: Baseline,
    pub current: CurrentStats,
    pub has_regression: bool,
    pub severity: RegressionSeverity,
    /// One-sided confidence that the shift is real, in [0, 1].
    pub confidence: f64,
    pub z_score: f64,
    pub mean_change_percent: f64,
    pub recommendations: Vec<String>,
}

pub struct RegressionDetector {
    config: RegressionConfig,
    baselines: Mutex<FxHashMap<String, Baseline>>,
}

impl RegressionDetector {
    pub fn new(config: RegressionConfig) -> Self {
        Self {
            config,
            baselines: Mutex::new(FxHashMap::default()),
        }
    }

    /// Compute and store a baseline. Fails with `InsufficientData` below the
    /// configured minimum sample count. Recomputing from the same snapshot
    /// yields identical statistics.
    pub fn create_baseline(&self, operation: &str, samples: &[Sample]) -> Result<Baseline> {
        if samples.len() < self.config.min_baseline_size {
            return Err(PerfError::InsufficientData {
                operation: operation.to_string(),
                actual: samples.len(),
                required: self.config.min_baseline_size,
            });
        }

        let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.total_cmp(b));

        let mean = stats::mean(&durations);
        let baseline = Baseline {
            operation: operation.to_string(),
            created_at: Utc::now(),
            sample_count: durations.len(),
            mean_ms: mean,
            stddev_ms: stats::stddev(&durations, mean),
            p50_ms: stats::percentile_nearest_rank(&durations, 50.0),
            p95_ms: stats::percentile_nearest_rank(&durations, 95.0),
            p99_ms: stats::percentile_nearest_rank(&durations, 99.0),
            min_ms: durations[0],
            max_ms: durations[durations.len() - 1],
        };

        info!(
            "baseline created for '{}': {} samples, mean {:.2}ms, p95 {:.2}ms",
            operation, baseline.sample_count, baseline.mean_ms, baseline.p95_ms
        );
        self.baselines
            .lock()
            .unwrap()
            .insert(operation.to_string(), baseline.clone());
        Ok(baseline)
    }

    pub fn baseline_for(&self, operation: &str) -> Option<Baseline> {
        self.baselines.lock().unwrap().get(operation).cloned()
    }

    /// Compare current samples against the stored baseline.
    pub fn detect_regression(
        &self,
        operation: &str,
        current_samples: &[Sample],
    ) -> Result<RegressionReport> {
        let baseline = self
            .baseline_for(operation)
            .ok_or_else(|| PerfError::BaselineNotFound(operation.to_string()))?;

        let mut durations: Vec<f64> = current_samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let current_mean = stats::mean(&durations);
        let current = CurrentStats {
            sample_count: durations.len(),
            mean_ms: current_mean,
            stddev_ms: stats::stddev(&durations, current_mean),
            p95_ms: stats::percentile_nearest_rank(&durations, 95.0),
        };

        let mean_change_percent = if baseline.mean_ms > 0.0 {
            (current.mean_ms - baseline.mean_ms) / baseline.mean_ms * 100.0
        } else {
            0.0
        };

        // Too few current samples: refuse to flag rather than false-positive.
        if current.sample_count < self.config.min_current_samples {
            debug!(
                "'{}': only {} current samples, skipping detection",
                operation, current.sample_count
            );
            return Ok(RegressionReport {
                operation: operation.to_string(),
                baseline,
                current,
                has_regression: false,
                severity: RegressionSeverity::None,
                confidence: 0.0,
                z_score: 0.0,
                mean_change_percent,
                recommendations: vec![format!(
                    "Accumulate at least {} samples before drawing conclusions",
                    self.config.min_current_samples
                )],
            });
        }

        let pooled_stderr = (baseline.stddev_ms.powi(2) / baseline.sample_count as f64
            + current.stddev_ms.powi(2) / current.sample_count as f64)
            .sqrt();
        let mean_delta = current.mean_ms - baseline.mean_ms;
        let z_score = if pooled_stderr > 0.0 {
            mean_delta / pooled_stderr
        } else if mean_delta > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let relative_increase = mean_change_percent / 100.0;
        let has_regression = z_score > self.config.z_threshold
            && relative_increase > self.config.min_effect_size;
        let confidence = stats::normal_cdf(z_score).clamp(0.0, 1.0);

        let severity = if !has_regression {
            RegressionSeverity::None
        } else if mean_change_percent < 25.0 {
            RegressionSeverity::Minor
        } else if mean_change_percent <= 75.0 {
            RegressionSeverity::Moderate
        } else {
            RegressionSeverity::Severe
        };

        let recommendations =
            build_recommendations(operation, &baseline, &current, severity, mean_change_percent);

        Ok(RegressionReport {
            operation: operation.to_string(),
            baseline,
            current,
            has_regression,
            severity,
            confidence,
            z_score,
            mean_change_percent,
            recommendations,
        })
    }

    /// Persist all stored baselines as JSON.
    pub fn save_baselines(&self, path: impl AsRef<Path>) -> Result<()> {
        let baselines = self.baselines.lock().unwrap();
        let serialized = serde_json::to_string_pretty(&*baselines)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    /// Load baselines from JSON, superseding any stored under the same
    /// operation name. Returns how many were loaded.
    pub fn load_baselines(&self, path: impl AsRef<Path>) -> Result<usize> {
        let raw = std::fs::read_to_string(path)?;
        let loaded: FxHashMap<String, Baseline> = serde_json::from_str(&raw)?;
        let count = loaded.len();
        self.baselines.lock().unwrap().extend(loaded);
        info!("loaded {} baselines", count);
        Ok(count)
    }

    /// Operations with a stored baseline, sorted.
    pub fn baselined_operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.baselines.lock().unwrap().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

fn build_recommendations(
    operation: &str,
    baseline: &Baseline,
    current: &CurrentStats,
    severity: RegressionSeverity,
    mean_change_percent: f64,
) -> Vec<String> {
    let mut recommendations = Vec::new();
    match severity {
        RegressionSeverity::Severe => {
            recommendations.push(format!(
                "Investigate recent changes to '{}' immediately: mean latency rose {:.0}%",
                operation, mean_change_percent
            ));
            recommendations.push(
                "Consider rolling back the most recent deployment touching this path".to_string(),
            );
        }
        RegressionSeverity::Moderate => {
            recommendations.push(format!(
                "Profile '{}' under production-like load: mean latency rose {:.0}%",
                operation, mean_change_percent
            ));
        }
        RegressionSeverity::Minor => {
            recommendations.push(format!(
                "Watch '{}' over the next sampling window before acting",
                operation
            ));
        }
        RegressionSeverity::None => {}
    }
    if current.p95_ms > baseline.p95_ms * 1.5 {
        recommendations.push(format!(
            "Tail latency widened: p95 {:.2}ms vs baseline {:.2}ms; check for contention or GC-like pauses",
            current.p95_ms, baseline.p95_ms
        ));
    }
    recommendations
}
