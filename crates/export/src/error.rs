//! Error types for the export pipeline.
//!
//! Each collaborator has its own enum; [`ExportError`] wraps them for the
//! runner and service. Only [`ExportError::user_message`] is ever written to a
//! job's `error_message`, so nothing internal (paths, backend errors) leaks out.

use thiserror::Error;

/// Errors raised by a [`RecordSource`](crate::source::RecordSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("query rejected: {0}")]
    Query(String),

    #[error("malformed source data: {0}")]
    Decode(String),
}

/// Errors raised while rendering records to an artifact.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV encode error: {0}")]
    Csv(#[from] csv::Error),

    #[error("bundle error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl SerializeError {
    fn user_message(&self) -> String {
        match self {
            SerializeError::Io(e) => format!("Failed to write export file ({})", e.kind()),
            SerializeError::Json(_) => "Failed to encode export data as JSON".to_string(),
            SerializeError::Csv(_) => "Failed to encode export data as CSV".to_string(),
            SerializeError::Zip(_) => "Failed to build export bundle".to_string(),
        }
    }
}

/// Errors raised by the status store or its key-value backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("{0}")]
    Unsupported(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Top-level error for submission, job execution and cleanup.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid export config: {0}")]
    InvalidConfig(String),

    #[error("record source error: {0}")]
    Source(#[from] SourceError),

    #[error("serialization error: {0}")]
    Serialize(#[from] SerializeError),

    #[error("status store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not allocate a unique job id after {0} attempts")]
    JobIdCollision(usize),

    #[error("export task failed: {0}")]
    Task(String),

    #[error("export job was deleted while running")]
    Cancelled,
}

impl ExportError {
    /// Human-readable message stored on a failed job.
    pub fn user_message(&self) -> String {
        match self {
            ExportError::InvalidConfig(msg) => format!("Invalid export config: {}", msg),
            ExportError::Source(e) => format!("Record source error: {}", e),
            ExportError::Serialize(e) => e.user_message(),
            ExportError::Store(_) => "Status store unavailable".to_string(),
            ExportError::Io(e) => format!("Storage error ({})", e.kind()),
            ExportError::JobIdCollision(_) => "Could not allocate a job id".to_string(),
            ExportError::Task(_) => "Export task terminated unexpectedly".to_string(),
            ExportError::Cancelled => "Export job was deleted".to_string(),
        }
    }

    /// Whether the caller sent a bad request (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        matches!(self, ExportError::InvalidConfig(_))
    }
}

pub type ExportResult<T> = Result<T, ExportError>;
