//! Common error types for driftsync.

use thiserror::Error;

/// Top-level error type for driftsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store could not be opened or provisioned. Fatal for the session.
    #[error("Store error: {0}")]
    Store(String),

    /// Remote link could not be established. The store stays usable.
    #[error("Link error: {0}")]
    Link(String),

    /// A reconciliation attempt failed.
    #[error("Sync error: {0}")]
    Sync(String),

    /// Notification permission was denied or revoked.
    #[error("Permission error: {0}")]
    Permission(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

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

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether this error leaves the local store unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
