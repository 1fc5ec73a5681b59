//! Common error types for RepSync.

use thiserror::Error;

/// Top-level error type for RepSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network or transport failure talking to the remote.
    #[error("Network error: {0}")]
    Network(String),

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

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

    /// Operation needs a signed-in user.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// A store's pull or push failed.
    #[error("Store '{store}' failed: {message}")]
    Store { store: String, message: String },

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Build a [`Error::Store`] for the named store.
    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
