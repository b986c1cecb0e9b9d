//! DTM Cryptographic Primitives
//!
//! Building blocks consumed by the handshake and channel engine. Everything
//! here is synchronous and holds no protocol state.
//!
//! # Key Lifecycle
//!
//! ```text
//! Auth phase:    ML-KEM keypair ──► encrypted KeyMaterial ──► StreamCipher (auth)
//!                                                                │
//! Primary phase: ML-KEM keypair ──► encrypted KeyMaterial ◄──────┘ (wrapped under auth)
//!                                          │
//!                                          ▼
//!                               StreamCipher (tx) / StreamCipher (rx)
//! ```
//!
//! Auth-phase material is wiped once the primary material is installed.
//! Forward records replace the primary material during a ratchet.
//!
//! # Security
//!
//! - All secret bytes live in [`SecretBytes`], which zeroizes on drop and
//!   compares in constant time.
//! - [`StreamCipher`] is a raw keystream: it provides confidentiality only.
//!   Integrity of the channel comes from the identity check performed during
//!   resynchronization and from the framing sanity checks upstream.
//! - Asymmetric encryption is ML-KEM encapsulation followed by
//!   XChaCha20-Poly1305 under an HKDF-expanded shared secret.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod asymmetric;
mod error;
pub mod kdf;
mod secret;
mod symmetric;

pub use asymmetric::{AsymmetricAlgorithm, AsymmetricCipher, AsymmetricKeyPair, PublicKey};
pub use error::{CryptoError, Result};
pub use kdf::KdfDigest;
pub use secret::SecretBytes;
pub use symmetric::{KeyMaterial, StreamCipher, SymmetricCipherKind, SymmetricSession};
