//! Error types for the DTM session engine.
//!
//! Every error carries a [`Severity`] so the application can triage it from a
//! single callback. Synchronous precondition failures are returned directly;
//! everything on the receive path is reported as a `SessionEvent::Error`.

use std::time::Duration;

use dtm_crypto::CryptoError;
use dtm_proto::{Phase, ProtocolError};
use thiserror::Error;

use crate::params::{ParameterId, SecurityClassification};

/// How bad an error is, as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Transport or liveness failure
    Connection,
    /// Cryptographic or protocol failure; the handshake or channel is unusable
    Critical,
    /// Recoverable condition the application may want to act on
    Warning,
    /// Data could not be delivered or the keystreams could not be realigned
    DataLoss,
}

/// Errors raised by the handshake and channel state machines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation invoked in a state that does not allow it
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        /// Description of the current state
        state: String,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Packet arrived out of protocol order
    #[error("unexpected packet: class {class:#04x} flag {flag} while {state}")]
    UnexpectedPacket {
        /// Description of the current state
        state: String,
        /// Raw class byte
        class: u8,
        /// Raw sub-type flag
        flag: u16,
    },

    /// Malformed packet or payload
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Key handling or decryption failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer announced a parameter set this side cannot resolve
    #[error("unknown parameter set {id}")]
    UnknownParameters {
        /// The unresolvable identifier
        id: ParameterId,
    },

    /// Peer runs a different security classification after negotiation
    #[error("classification mismatch: local {local:?}, remote {remote:?}")]
    ClassificationMismatch {
        /// Local classification
        local: SecurityClassification,
        /// Classification the peer announced
        remote: Option<SecurityClassification>,
    },

    /// A handshake phase got no reply in time
    #[error("handshake timeout in {phase:?} after {elapsed:?}")]
    HandshakeTimeout {
        /// Phase that was awaiting a reply
        phase: Option<Phase>,
        /// How long we waited
        elapsed: Duration,
    },

    /// Keepalive pulses went unanswered
    #[error("connection timeout after {missed} missed pulses")]
    ConnectionTimeout {
        /// Consecutive missed pulses
        missed: u32,
    },

    /// The application cancelled
    #[error("vetoed by application during {context}")]
    Vetoed {
        /// Where the veto happened
        context: &'static str,
    },

    /// Retransmissions exceeded their bound
    #[error("data loss: {0}")]
    DataLoss(String),

    /// Keystream realignment failed
    #[error("resync failed: {0}")]
    ResyncFailed(String),

    /// Peer declined a forwarding or transfer request
    #[error("refused by peer: {0}")]
    Refused(String),

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer sent a terminate notice
    #[error("peer terminated: {0}")]
    PeerTerminated(String),
}

impl SessionError {
    /// Severity reported alongside this error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::HandshakeTimeout { .. }
            | Self::ConnectionTimeout { .. }
            | Self::Transport(_)
            | Self::PeerTerminated(_) => Severity::Connection,
            Self::UnexpectedPacket { .. }
            | Self::Protocol(_)
            | Self::Crypto(_)
            | Self::UnknownParameters { .. }
            | Self::ClassificationMismatch { .. } => Severity::Critical,
            Self::InvalidState { .. } | Self::Vetoed { .. } | Self::Refused(_) => Severity::Warning,
            Self::DataLoss(_) | Self::ResyncFailed(_) => Severity::DataLoss,
        }
    }

    /// True if the session cannot continue after this error.
    ///
    /// Non-fatal errors are still reported; the application's cancel flag
    /// decides whether they end the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState { .. } | Self::DataLoss(_) | Self::Refused(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_are_not_fatal() {
        let err = SessionError::DataLoss("resend bound exceeded".to_string());
        assert_eq!(err.severity(), Severity::DataLoss);
        assert!(!err.is_fatal());

        let err = SessionError::Refused("key forwarding".to_string());
        assert_eq!(err.severity(), Severity::Warning);
        assert!(!err.is_fatal());
    }

    #[test]
    fn crypto_failures_are_critical_and_fatal() {
        let err = SessionError::from(CryptoError::DecryptionFailed { reason: "tag".to_string() });
        assert_eq!(err.severity(), Severity::Critical);
        assert!(err.is_fatal());
    }

    #[test]
    fn resync_failure_is_fatal_data_loss() {
        let err = SessionError::ResyncFailed("negative gap".to_string());
        assert_eq!(err.severity(), Severity::DataLoss);
        assert!(err.is_fatal());
    }

    #[test]
    fn timeouts_are_connection_errors() {
        let err = SessionError::ConnectionTimeout { missed: 11 };
        assert_eq!(err.severity(), Severity::Connection);
        assert!(err.is_fatal());
    }
}
