//! Error types for the queue.

use thiserror::Error;

/// Errors that can occur in queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Snapshot file could not be read or written.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file is not valid JSON.
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The key is held by an in-flight job.
    #[error("job is active: {0}")]
    JobActive(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The caller's lease was reclaimed or replaced.
    #[error("lease lost for {key} ({id})")]
    LeaseLost { key: String, id: String },

    /// Invalid queue or job configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Empty logical key.
    #[error("job key must not be empty")]
    InvalidKey,
}
