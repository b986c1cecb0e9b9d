//! Driver error types.

use std::time::Duration;

use dtm_core::SessionError;
use thiserror::Error;

/// Errors surfaced by the Tokio driver.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open, accept or re-open the TCP connection
    #[error("connection failed: {0}")]
    Connection(String),

    /// A write kept failing after exponential back-off
    #[error("write failed after {attempts} attempts: {reason}")]
    Write {
        /// Attempts made, including the last
        attempts: u32,
        /// Last I/O error
        reason: String,
    },

    /// The session's driver task has stopped
    #[error("session closed")]
    Closed,

    /// The handshake ended without establishing a channel
    #[error("handshake failed: {0}")]
    Handshake(SessionError),

    /// The protocol engine rejected the operation
    #[error(transparent)]
    Session(#[from] SessionError),

    /// No reply arrived in time
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// A file transfer could not be set up or did not finish
    #[error("file transfer failed: {0}")]
    Transfer(String),
}

impl TransportError {
    pub(crate) fn connection(context: &str, error: &std::io::Error) -> Self {
        Self::Connection(format!("{context}: {error}"))
    }
}
