//! Error types for the jobd data model.

use thiserror::Error;

/// Unified error type for model validation and configuration.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Illegal status transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}
