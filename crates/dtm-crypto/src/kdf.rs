//! Key derivation using HKDF.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

use crate::error::{CryptoError, Result};

/// Digest used for HKDF key expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfDigest {
    /// HKDF-SHA256
    Sha256,
    /// HKDF-SHA512
    Sha512,
}

impl KdfDigest {
    /// Identifier used in parameter-set ids (0 means "no KDF").
    pub const fn id(self) -> u8 {
        match self {
            Self::Sha256 => 1,
            Self::Sha512 => 2,
        }
    }

    /// Resolve an identifier. `Ok(None)` for 0.
    pub fn from_id(id: u8) -> Result<Option<Self>> {
        match id {
            0 => Ok(None),
            1 => Ok(Some(Self::Sha256)),
            2 => Ok(Some(Self::Sha512)),
            other => Err(CryptoError::UnsupportedDescriptor(format!("unknown kdf digest id {other}"))),
        }
    }
}

/// Fill `out` with HKDF output.
///
/// # Errors
///
/// - `InvalidKeyLength` if `out` exceeds 255 digest blocks
pub fn expand(digest: KdfDigest, ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    let salt = (!salt.is_empty()).then_some(salt);
    let result = match digest {
        KdfDigest::Sha256 => Hkdf::<Sha256>::new(salt, ikm).expand(info, out),
        KdfDigest::Sha512 => Hkdf::<Sha512>::new(salt, ikm).expand(info, out),
    };
    result.map_err(|_| CryptoError::InvalidKeyLength { expected: max_output(digest), actual: out.len() })
}

fn max_output(digest: KdfDigest) -> usize {
    match digest {
        KdfDigest::Sha256 => 255 * 32,
        KdfDigest::Sha512 => 255 * 64,
    }
}
