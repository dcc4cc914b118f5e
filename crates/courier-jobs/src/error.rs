//! Job error types.

use courier_core::CourierError;
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Queue backend connection or channel could not be (re)established.
    #[error("Queue backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A workable type violates its registration contract.
    #[error("Invalid workable: {0}")]
    InvalidWorkable(String),

    /// No workable is registered under the name.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job's own logic failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// The execution did not finish within its timeout.
    #[error("Job timed out after {:.1} seconds", .0.as_secs_f64())]
    ExecutionTimedOut(Duration),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// AMQP broker error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates an execution failure from any displayable error.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        JobError::ExecutionFailed(message.to_string())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_)
                | JobError::ExecutionTimedOut(_)
                | JobError::BackendUnavailable(_)
                | JobError::Redis(_)
                | JobError::Pool(_)
                | JobError::Amqp(_)
        )
    }

    /// Returns true if the failure came from the queue backend.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            JobError::BackendUnavailable(_) | JobError::Redis(_) | JobError::Pool(_) | JobError::Amqp(_)
        )
    }

    /// Message stamped into `_last_error` when the payload is requeued.
    ///
    /// Execution failures carry the job's own message without the variant prefix.
    pub fn failure_message(&self) -> String {
        match self {
            JobError::ExecutionFailed(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::BackendUnavailable(_) => "backend_unavailable",
            JobError::InvalidWorkable(_) => "invalid_workable",
            JobError::JobNotFound(_) => "job_not_found",
            JobError::ExecutionFailed(_) => "execution_failed",
            JobError::ExecutionTimedOut(_) => "timed_out",
            JobError::Serialization(_) => "serialization",
            JobError::Redis(_) => "redis",
            JobError::Pool(_) => "pool",
            JobError::Amqp(_) => "amqp",
            JobError::Configuration(_) => "configuration",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<JobError> for CourierError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::JobNotFound(name) => CourierError::not_found("Job", name),
            JobError::InvalidWorkable(msg) => CourierError::InvalidWorkable(msg),
            JobError::Configuration(msg) => CourierError::Configuration(msg),
            other if other.is_backend() => CourierError::Backend {
                driver: other.kind().to_string(),
                message: other.to_string(),
            },
            other => CourierError::Internal(other.to_string()),
        }
    }
}
