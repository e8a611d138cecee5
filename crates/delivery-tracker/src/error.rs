//! Error types for the delivery tracker.

use thiserror::Error;

/// Delivery tracker error type.
///
/// These never cross the public mutator boundary: `mark_sent`, `confirm`
/// and `fail` turn them into a log line plus a `false` return.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// No runtime or running tracker is available to schedule background work
    #[error("No scheduler available: {0}")]
    SchedulerUnavailable(String),

    /// Event id is not (or no longer) tracked
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using TrackerError.
pub type TrackerResult<T> = Result<T, TrackerError>;
