//! Logging setup for binaries and integration harnesses: human-readable
//! console output plus rotating structured files.
//!
//! Library code only emits `tracing` events; nothing in the engine installs
//! a subscriber on its own.

use tracing_appender::non_blocking;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{PerfError, Result};

/// Logging configuration options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory to store log files.
    pub log_dir: String,
    /// Log level filter (e.g., "info", "perf_engine=debug").
    pub level_filter: String,
    /// Whether to use JSON format for file logs.
    pub file_json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            level_filter: "info,perf_engine=info".to_string(),
            file_json_format: true,
        }
    }
}

/// Initialize dual output logging (console + daily-rotating files).
///
/// Returns a guard that must be kept alive for the duration of the process
/// so the background logging thread keeps flushing.
pub fn init_dual_logging(
    config: &LoggingConfig,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level_filter));
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level_filter));

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "perf_engine.log");
    let (file_writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_level(true)
        .with_target(true)
        .with_filter(console_filter);

    let file_layer = if config.file_json_format {
        fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(file_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(file_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PerfError::InvalidConfig(format!("logging init failed: {e}")))?;

    tracing::info!(
        log_dir = %config.log_dir,
        json_format = config.file_json_format,
        "dual logging initialized"
    );
    Ok(guard)
}

/// Console-only logging for tests and minimal setups.
pub fn init_simple_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info,perf_engine=info")
        .try_init()
        .map_err(|e| PerfError::InvalidConfig(format!("logging init failed: {e}")))?;
    Ok(())
}
