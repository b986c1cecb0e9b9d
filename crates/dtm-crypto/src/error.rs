//! Error types for cryptographic operations.

use thiserror::Error;

/// Result alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors from key handling, encryption and decryption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key or IV does not have the length the descriptor requires
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Public key bytes do not decode for the named algorithm
    #[error("invalid public key for {algorithm}")]
    InvalidPublicKey {
        /// Algorithm name
        algorithm: &'static str,
    },

    /// Ciphertext is malformed or too short
    #[error("invalid ciphertext: {reason}")]
    InvalidCiphertext {
        /// What was wrong
        reason: String,
    },

    /// Authentication or decapsulation failed
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Why decryption failed
        reason: String,
    },

    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Symmetric session descriptor is inconsistent or names unknown ids
    #[error("unsupported session descriptor: {0}")]
    UnsupportedDescriptor(String),

    /// The stream cipher reached the end of its keystream
    #[error("keystream exhausted after {processed} bytes")]
    KeystreamExhausted {
        /// Bytes processed before exhaustion
        processed: u64,
    },
}
