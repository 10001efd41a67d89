//! Store error types.

use thiserror::Error;

use jobd_types::TypesError;

/// Errors that can occur in the store layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Snapshot file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Snapshot on disk could not be parsed
    #[error("Corrupt store at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A model rule rejected the change
    #[error(transparent)]
    Invalid(#[from] TypesError),

    /// A thread panicked while holding the store lock
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
