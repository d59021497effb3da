use std::path::PathBuf;

use thiserror::Error;

use crate::state_machine::JobState;

/// Errors returned by [`JobController::submit`](crate::controller::JobController::submit).
/// Everything after worker start ends in a job report instead.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

/// Reasons a submission is refused before any worker starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required parameter {0}")]
    Missing(&'static str),

    #[error("parameter {name} is not a valid {expected}: {value:?}")]
    Malformed {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("parameter {name} is out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },

    #[error("count ({count}) must not exceed limit ({limit})")]
    CountExceedsLimit { count: u64, limit: u64 },

    #[error("invalid resource quantity {0:?}")]
    Quantity(String),
}

/// Failures while publishing a result artifact.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("artifact for job {0} was already published")]
    AlreadyPublished(String),

    #[error("artifact file already exists: {}", .0.display())]
    Exists(PathBuf),

    #[error("HTTP sink returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An event arrived that the lifecycle does not allow in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event {event} is not valid in state {state}")]
pub struct TransitionError {
    pub state: JobState,
    pub event: String,
}
