//! Common error types for fleetsync.

use thiserror::Error;

/// Top-level error type for fleetsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is missing or invalid. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Replication with the remote replica failed.
    #[error("Replication error: {0}")]
    Replication(String),

    /// Delivering an outbox event to live subscribers failed.
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not supported by the bound backend.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether the error is expected to clear up on a later pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Replication(_) | Error::Broadcast(_) | Error::Storage(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
