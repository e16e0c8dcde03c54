//! Engine configuration loaded from code or from a `config.toml` section.
//!
//! Every section has a `Default` so callers can start with
//! `EngineConfig::default()` and override the fields they care about.
//! `validate()` rejects configurations that would make measurement
//! meaningless before anything is constructed.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PerfError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub profiler: ProfilerConfig,
    pub cache: CacheConfig,
    pub benchmark: BenchmarkDefaults,
    pub regression: RegressionConfig,
    pub monitor: MonitorConfig,
    pub optimizer: OptimizerConfig,
    /// Start the sampling tick and cache sweep on engine construction.
    /// Tests disable this to stay fully deterministic.
    pub enable_background_tasks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            profiler: ProfilerConfig::default(),
            cache: CacheConfig::default(),
            benchmark: BenchmarkDefaults::default(),
            regression: RegressionConfig::default(),
            monitor: MonitorConfig::default(),
            optimizer: OptimizerConfig::default(),
            enable_background_tasks: true,
        }
    }
}

/// Sample buffer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Ring capacity per operation; the oldest sample is evicted on overflow.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Profiler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Interval of the background tick that augments open scopes with
    /// interim CPU/memory readings.
    pub sampling_interval_ms: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 100,
        }
    }
}

impl ProfilerConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }
}

/// Adaptive cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    /// Background sweep cadence for expired-entry reclamation.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Benchmark runner defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchmarkDefaults {
    /// Upper bound on concurrently executing suite benchmarks.
    pub max_concurrency: usize,
    /// How many past results to retain per benchmark name for trend analysis.
    pub history_size: usize,
}

impl Default for BenchmarkDefaults {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            history_size: 20,
        }
    }
}

/// Regression detector settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    /// Minimum samples required to create a baseline.
    pub min_baseline_size: usize,
    /// Below this many current samples the detector refuses to flag anything.
    pub min_current_samples: usize,
    /// Two-sample z-score above which a shift is statistically significant.
    pub z_threshold: f64,
    /// Minimum relative mean increase (0.10 = 10%) before a statistically
    /// significant shift is considered a practical regression.
    pub min_effect_size: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            min_baseline_size: 30,
            min_current_samples: 5,
            z_threshold: 2.0,
            min_effect_size: 0.10,
        }
    }
}

/// Metric monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Bounded incident history kept in memory.
    pub incident_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            incident_history: 256,
        }
    }
}

/// Optimization engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// TTL for memoized per-service analysis results.
    pub recommendation_ttl_secs: u64,
    pub recommendation_cache_entries: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            recommendation_ttl_secs: 120,
            recommendation_cache_entries: 256,
        }
    }
}

impl OptimizerConfig {
    pub fn recommendation_ttl(&self) -> Duration {
        Duration::from_secs(self.recommendation_ttl_secs)
    }
}

impl EngineConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&raw).map_err(|e| PerfError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer.capacity == 0 {
            return Err(PerfError::InvalidConfig(
                "buffer.capacity must be greater than zero".to_string(),
            ));
        }
        if self.profiler.sampling_interval_ms == 0 {
            return Err(PerfError::InvalidConfig(
                "profiler.sampling_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(PerfError::InvalidConfig(
                "cache.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.benchmark.max_concurrency == 0 {
            return Err(PerfError::InvalidConfig(
                "benchmark.max_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.benchmark.history_size == 0 {
            return Err(PerfError::InvalidConfig(
                "benchmark.history_size must be greater than zero".to_string(),
            ));
        }
        if self.regression.min_baseline_size < 2 {
            return Err(PerfError::InvalidConfig(
                "regression.min_baseline_size must be at least 2".to_string(),
            ));
        }
        if self.regression.z_threshold <= 0.0 {
            return Err(PerfError::InvalidConfig(
                "regression.z_threshold must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.regression.min_effect_size) {
            return Err(PerfError::InvalidConfig(
                "regression.min_effect_size must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = EngineConfig::default();
        config.buffer.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(PerfError::InvalidConfig(_))
        ));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [buffer]
            capacity = 64

            [regression]
            z_threshold = 2.5
            "#,
        )
        .expect("toml parses");

        assert_eq!(config.buffer.capacity, 64);
        assert_eq!(config.regression.z_threshold, 2.5);
        assert_eq!(config.regression.min_baseline_size, 30);
        assert_eq!(config.profiler.sampling_interval_ms, 100);
        assert!(config.enable_background_tasks);
    }
}
