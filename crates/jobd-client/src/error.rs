//! Error types for the jobd client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when talking to the daemon.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to connect to the daemon socket
    #[error("Connection to {path} failed: {source}")]
    Connection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Socket read/write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The daemon answered with `success: false`
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Malformed or unexpected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response within the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// True when the daemon is not listening (no socket or refused).
    pub fn is_not_running(&self) -> bool {
        matches!(
            self,
            ClientError::Connection { source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                )
        )
    }
}
