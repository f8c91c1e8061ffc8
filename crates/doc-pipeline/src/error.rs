//! Error types for the document pipeline

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors surfaced to callers of the store, queue and dispatcher.
///
/// Failures of an individual job execution are not represented here; those
/// are recorded on the job as a [`crate::types::JobError`].
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown job type, malformed options or a missing input reference
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store already holds the configured maximum of pending jobs
    #[error("Resource exhausted: {pending} pending jobs (limit {limit})")]
    ResourceExhausted { pending: usize, limit: usize },

    /// A finalize/requeue presented a claim token that is no longer current
    #[error("Stale claim for job {job_id} (token {claim_token})")]
    StaleClaim { job_id: Uuid, claim_token: i64 },

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Job store failure (unavailable, corrupt row, constraint violation)
    #[error("Job store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this is the concurrency guard rejection
    pub fn is_stale_claim(&self) -> bool {
        matches!(self, Error::StaleClaim { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.to_string())
    }
}
