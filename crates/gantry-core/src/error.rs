//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Workflow errors
    #[error("Invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled: {reason}")]
    Cancelled { reason: String },

    // Scheduling errors
    #[error("No agent can satisfy labels: {labels:?}")]
    Scheduling { labels: Vec<String> },

    // Step errors
    #[error("Step {step} failed with exit code {exit_code:?}")]
    StepFailed { step: String, exit_code: Option<i32> },

    #[error("Step {step} timed out after {seconds} seconds")]
    StepTimeout { step: String, seconds: u64 },

    #[error("Command could not be started: {0}")]
    Spawn(String),

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether the error describes a cooperative cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
