//! Error types for the analysis runtime.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by the pose capability
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Inference cannot run at all in this environment
    #[error("pose estimation unavailable: {0}")]
    Unavailable(String),

    #[error("pose estimation failed: {0}")]
    Failed(String),

    #[error("pose estimation I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reason a job ended without a completed report
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("analysis timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("analysis panicked: {0}")]
    Panicked(String),

    #[error("analysis task aborted")]
    Aborted,
}

/// Rejected job submission
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("analysis queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("analysis runtime is shut down")]
    Closed,

    #[error("failed to record pending status: {0:#}")]
    EventLog(anyhow::Error),
}
