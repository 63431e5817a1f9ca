//! Job error types.

use conveyor_core::ConveyorError;
use thiserror::Error;

/// Result type for job subsystem operations.
pub type JobsResult<T> = Result<T, JobError>;

/// Errors raised by the broker, registry, dispatcher and status resolver.
///
/// Failures that happen while a job executes are never raised through this
/// type; they are recorded in the job's result as a
/// [`JobFailure`](crate::job::JobFailure).
#[derive(Debug, Error)]
pub enum JobError {
    /// Broker or result store unreachable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No handler registered for the kind.
    #[error("Unknown job kind: {0}")]
    UnknownKind(String),

    /// A handler is already registered for the kind.
    #[error("Job kind already registered: {0}")]
    DuplicateKind(String),

    /// A producer-supplied id is already in use.
    #[error("Job id already in use: {0}")]
    DuplicateJobId(String),

    /// Arguments do not match the kind's declared parameters.
    #[error("Invalid arguments for {kind}: {reason}")]
    InvalidArguments { kind: String, reason: String },

    /// Job id was never submitted (or its record expired).
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker pool error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transport(_))
    }

    /// Creates an invalid arguments error.
    pub fn invalid_arguments(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        JobError::InvalidArguments {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for JobError {
    fn from(err: redis::RedisError) -> Self {
        JobError::Transport(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for JobError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        JobError::Transport(err.to_string())
    }
}

impl From<JobError> for ConveyorError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::UnknownKind(_) | JobError::InvalidArguments { .. } => {
                ConveyorError::Validation(err.to_string())
            }
            JobError::DuplicateJobId(_) | JobError::DuplicateKind(_) => {
                ConveyorError::Conflict(err.to_string())
            }
            JobError::NotFound(id) => ConveyorError::not_found("Job", id),
            JobError::Transport(_) => ConveyorError::ServiceUnavailable(err.to_string()),
            JobError::Configuration(msg) => ConveyorError::Configuration(msg),
            JobError::Serialization(_) | JobError::Worker(_) | JobError::Internal(_) => {
                ConveyorError::Internal(err.to_string())
            }
        }
    }
}
