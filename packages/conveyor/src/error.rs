//! Error types for the queue.
//!
//! Two error families live here:
//! - [`QueueError`] - infrastructure failures surfaced by drivers, the client,
//!   the worker, and the scheduler. Pattern-matchable, `thiserror`-backed.
//! - [`JobError`] - the outcome a job handler reports. Its variant decides
//!   whether the worker retries, fails permanently, or treats the run as
//!   cancelled. Anything convertible from `anyhow::Error` lands in
//!   [`JobError::Retryable`], so handlers can use `?` freely.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Infrastructure errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be mapped back to a domain type
    /// (unknown status string, malformed stage list, ...).
    #[error("corrupt record: {0}")]
    Decode(String),

    #[error("invalid cron expression {expr:?}: {message}")]
    InvalidCron { expr: String, message: String },

    /// `ReplacePolicy::Always` was asked to supersede a job that is
    /// currently being processed. Replacing live work is refused.
    #[error("job with key {key:?} is currently processing and cannot be replaced")]
    ReplaceActive { key: String },

    #[error("stages already initialized")]
    StagesAlreadyInitialized,

    #[error("duplicate stage name {0:?}")]
    DuplicateStage(String),

    #[error("unknown stage {0:?}")]
    UnknownStage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The outcome of a job handler run.
///
/// The worker maps each variant onto the job lifecycle:
/// - [`JobError::Retryable`] counts the attempt and requeues with backoff
///   while attempts remain, then fails.
/// - [`JobError::Permanent`] fails immediately, no retry.
/// - [`JobError::Cancelled`] is treated like a retryable failure; if the
///   cancellation came from an explicit `cancel` call the job row is already
///   `failed` and the worker's conditional commit becomes a no-op.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Retryable(anyhow::Error),

    #[error("{0}")]
    Permanent(anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    /// Transient failure, retried while attempts remain.
    pub fn retryable(msg: impl Into<String>) -> Self {
        JobError::Retryable(anyhow::anyhow!(msg.into()))
    }

    /// Permanent failure, never retried.
    pub fn permanent(msg: impl Into<String>) -> Self {
        JobError::Permanent(anyhow::anyhow!(msg.into()))
    }

    /// Whether the worker may retry after this error.
    pub fn should_retry(&self) -> bool {
        matches!(self, JobError::Retryable(_) | JobError::Cancelled)
    }
}

/// Unclassified errors are transient by default.
impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Retryable(err)
    }
}

/// Infrastructure errors inside a handler (failed stage writes, lost
/// connections) are transient too.
impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        JobError::Retryable(err.into())
    }
}
