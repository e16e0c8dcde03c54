//! Error taxonomy for the performance engine.
//!
//! Transient per-iteration failures (timeouts, flaky target calls) are folded
//! into aggregate failure-rate statistics and never surfaced here; only
//! configuration-level problems and missing-data conditions reach callers.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PerfError {
    #[error("insufficient data for '{operation}': {actual} samples, minimum {required}")]
    InsufficientData {
        operation: String,
        actual: usize,
        required: usize,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resolved internally via eviction; callers never see this one.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("no baseline recorded for operation '{0}'")]
    BaselineNotFound(String),

    #[error("no active profiling session '{0}'")]
    SessionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PerfError>;
