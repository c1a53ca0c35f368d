//! Typed errors for the job engine.
//!
//! Uses `thiserror` so callers (the supervisor, the HTTP layer) can match on
//! the failure instead of parsing messages.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while storing, running, or serving jobs.
#[derive(Debug, Error)]
pub enum JobError {
    /// No record exists for this job id
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// A record with this id was already created
    #[error("job already exists: {0}")]
    AlreadyExists(Uuid),

    /// The job exists but has no report content or readable report file
    #[error("report not found for job {0}")]
    ReportNotFound(Uuid),

    /// An external stage exited unsuccessfully
    #[error("command failed ({}): {command}", describe_exit(.code))]
    StageFailed { code: Option<i32>, command: String },

    /// An external stage could not be launched at all
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem or pipe I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage backend failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Request payload could not be (de)serialized
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The concurrency gate was shut down while waiting for a permit
    #[error("concurrency gate closed")]
    GateClosed,
}

impl JobError {
    /// Wrap any storage backend error.
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        JobError::Storage(Box::new(err))
    }

    /// Whether this error means the job id is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_) | JobError::ReportNotFound(_))
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::storage(err)
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Result type alias for job operations.
pub type Result<T> = std::result::Result<T, JobError>;
