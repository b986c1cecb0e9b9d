//! Framing errors.

use thiserror::Error;

/// Result alias for framing operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Structural errors raised while decoding packets.
///
/// None of these are fatal on their own: the receive path answers them with a
/// retransmission request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a full header
    #[error("header too short: expected {expected} bytes, got {actual}")]
    HeaderTooShort {
        /// Header size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Packet class byte does not name a known class
    #[error("unknown packet class: {0:#04x}")]
    UnknownPacketClass(u8),

    /// Declared payload length is negative
    #[error("negative payload length: {0}")]
    NegativeLength(i64),

    /// Declared payload length exceeds the configured maximum
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared size
        size: u64,
        /// Maximum accepted size
        max: u64,
    },

    /// Buffer ends before the declared payload does
    #[error("truncated packet: expected {expected} payload bytes, got {actual}")]
    Truncated {
        /// Declared payload length
        expected: usize,
        /// Bytes available after the header
        actual: usize,
    },

    /// Structured payload could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(String),
}
