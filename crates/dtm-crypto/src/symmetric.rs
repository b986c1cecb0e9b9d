//! Symmetric session descriptors, key material and keyed stream ciphers.

use chacha20::{
    ChaCha8, ChaCha12, ChaCha20, XChaCha20,
    cipher::{KeyIvInit, StreamCipher as _},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    SecretBytes,
    error::{CryptoError, Result},
    kdf::{self, KdfDigest},
};

/// HKDF info label for stream keys derived from transmitted material
const STREAM_KEY_LABEL: &[u8] = b"dtmStreamKeyV1";

/// Cipher key size for every ChaCha variant
const CHACHA_KEY_SIZE: usize = 32;

/// Chunk size used when advancing the keystream with filler
const ADVANCE_CHUNK: usize = 4096;

/// Stream cipher family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmetricCipherKind {
    /// ChaCha20 with a 96-bit nonce
    ChaCha20,
    /// ChaCha with 12 rounds
    ChaCha12,
    /// ChaCha with 8 rounds
    ChaCha8,
    /// ChaCha20 with a 192-bit nonce
    XChaCha20,
}

impl SymmetricCipherKind {
    /// Identifier used in parameter-set ids.
    pub const fn id(self) -> u8 {
        match self {
            Self::ChaCha20 => 1,
            Self::ChaCha12 => 2,
            Self::ChaCha8 => 3,
            Self::XChaCha20 => 4,
        }
    }

    /// Resolve an identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::ChaCha20),
            2 => Ok(Self::ChaCha12),
            3 => Ok(Self::ChaCha8),
            4 => Ok(Self::XChaCha20),
            other => Err(CryptoError::UnsupportedDescriptor(format!("unknown cipher id {other}"))),
        }
    }

    /// Round count.
    pub const fn rounds(self) -> u8 {
        match self {
            Self::ChaCha20 | Self::XChaCha20 => 20,
            Self::ChaCha12 => 12,
            Self::ChaCha8 => 8,
        }
    }

    /// Nonce size the cipher consumes.
    pub const fn nonce_size(self) -> usize {
        match self {
            Self::XChaCha20 => 24,
            Self::ChaCha20 | Self::ChaCha12 | Self::ChaCha8 => 12,
        }
    }
}

/// Describes how a symmetric session is keyed.
///
/// Without a KDF the key and IV feed the cipher directly and must match its
/// native sizes. With a KDF they are input keying material and salt, and any
/// sizes of at least 16 and 8 bytes are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymmetricSession {
    /// Cipher selection
    pub cipher: SymmetricCipherKind,
    /// Key material size in bytes
    pub key_size: usize,
    /// IV size in bytes
    pub iv_size: usize,
    /// Round count, must agree with `cipher`
    pub rounds: u8,
    /// Optional HKDF digest applied to the key material
    pub kdf: Option<KdfDigest>,
}

impl SymmetricSession {
    /// Descriptor using the cipher's native key and nonce sizes.
    pub const fn native(cipher: SymmetricCipherKind) -> Self {
        Self {
            cipher,
            key_size: CHACHA_KEY_SIZE,
            iv_size: cipher.nonce_size(),
            rounds: cipher.rounds(),
            kdf: None,
        }
    }

    /// Descriptor whose key material is expanded with HKDF.
    pub const fn derived(
        cipher: SymmetricCipherKind,
        key_size: usize,
        iv_size: usize,
        digest: KdfDigest,
    ) -> Self {
        Self { cipher, key_size, iv_size, rounds: cipher.rounds(), kdf: Some(digest) }
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// - `UnsupportedDescriptor` when rounds disagree with the cipher or the
    ///   sizes cannot key it
    pub fn validate(&self) -> Result<()> {
        if self.rounds != self.cipher.rounds() {
            return Err(CryptoError::UnsupportedDescriptor(format!(
                "{:?} runs {} rounds, descriptor says {}",
                self.cipher,
                self.cipher.rounds(),
                self.rounds
            )));
        }

        let sizes_ok = match self.kdf {
            None => self.key_size == CHACHA_KEY_SIZE && self.iv_size == self.cipher.nonce_size(),
            Some(_) => self.key_size >= 16 && self.iv_size >= 8,
        };
        if !sizes_ok {
            return Err(CryptoError::UnsupportedDescriptor(format!(
                "key/iv sizes {}/{} do not fit {:?} (kdf {:?})",
                self.key_size, self.iv_size, self.cipher, self.kdf
            )));
        }
        Ok(())
    }
}

/// Symmetric key and IV for one direction of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// Key bytes
    pub key: SecretBytes,
    /// IV bytes
    pub iv: SecretBytes,
}

impl KeyMaterial {
    /// Fresh key material sized for `session`, filled by `fill`.
    ///
    /// `fill` must draw from a cryptographically secure source in production.
    pub fn generate(session: &SymmetricSession, mut fill: impl FnMut(&mut [u8])) -> Self {
        let mut key = SecretBytes::zeroed(session.key_size);
        let mut iv = SecretBytes::zeroed(session.iv_size);
        fill(key.as_mut_bytes());
        fill(iv.as_mut_bytes());
        Self { key, iv }
    }

    /// Zero both halves in place.
    pub fn wipe(&mut self) {
        self.key.wipe();
        self.iv.wipe();
    }

    /// True once both halves are all zero.
    pub fn is_zeroed(&self) -> bool {
        self.key.is_zeroed() && self.iv.is_zeroed()
    }

    /// Check the sizes against `session`.
    pub fn check(&self, session: &SymmetricSession) -> Result<()> {
        if self.key.len() != session.key_size {
            return Err(CryptoError::InvalidKeyLength {
                expected: session.key_size,
                actual: self.key.len(),
            });
        }
        if self.iv.len() != session.iv_size {
            return Err(CryptoError::InvalidKeyLength {
                expected: session.iv_size,
                actual: self.iv.len(),
            });
        }
        Ok(())
    }
}

enum Engine {
    ChaCha20(ChaCha20),
    ChaCha12(ChaCha12),
    ChaCha8(ChaCha8),
    XChaCha20(XChaCha20),
}

impl Engine {
    fn apply(&mut self, buf: &mut [u8]) -> std::result::Result<(), chacha20::cipher::StreamCipherError> {
        match self {
            Self::ChaCha20(c) => c.try_apply_keystream(buf),
            Self::ChaCha12(c) => c.try_apply_keystream(buf),
            Self::ChaCha8(c) => c.try_apply_keystream(buf),
            Self::XChaCha20(c) => c.try_apply_keystream(buf),
        }
    }
}

/// A keyed keystream for one direction.
///
/// Encryption and decryption are the same operation. The cipher counts every
/// byte it transforms; that count is the byte ledger used to realign the
/// keystream after loss.
pub struct StreamCipher {
    session: SymmetricSession,
    engine: Engine,
    processed: u64,
}

impl StreamCipher {
    /// Key a cipher from `material` under `session`.
    ///
    /// # Errors
    ///
    /// - `UnsupportedDescriptor` if the descriptor is inconsistent
    /// - `InvalidKeyLength` if the material does not match the descriptor
    pub fn new(session: &SymmetricSession, material: &KeyMaterial) -> Result<Self> {
        session.validate()?;
        material.check(session)?;

        let nonce_size = session.cipher.nonce_size();
        let mut okm = vec![0u8; CHACHA_KEY_SIZE + nonce_size];
        match session.kdf {
            Some(digest) => kdf::expand(
                digest,
                material.key.as_bytes(),
                material.iv.as_bytes(),
                STREAM_KEY_LABEL,
                &mut okm,
            )?,
            None => {
                okm[..CHACHA_KEY_SIZE].copy_from_slice(material.key.as_bytes());
                okm[CHACHA_KEY_SIZE..].copy_from_slice(material.iv.as_bytes());
            },
        }

        let (key, nonce) = okm.split_at(CHACHA_KEY_SIZE);
        let engine = match session.cipher {
            SymmetricCipherKind::ChaCha20 => ChaCha20::new_from_slices(key, nonce).map(Engine::ChaCha20),
            SymmetricCipherKind::ChaCha12 => ChaCha12::new_from_slices(key, nonce).map(Engine::ChaCha12),
            SymmetricCipherKind::ChaCha8 => ChaCha8::new_from_slices(key, nonce).map(Engine::ChaCha8),
            SymmetricCipherKind::XChaCha20 => {
                XChaCha20::new_from_slices(key, nonce).map(Engine::XChaCha20)
            },
        };
        okm.zeroize();

        let engine = engine.map_err(|_| CryptoError::InvalidKeyLength {
            expected: CHACHA_KEY_SIZE + nonce_size,
            actual: material.key.len() + material.iv.len(),
        })?;

        Ok(Self { session: *session, engine, processed: 0 })
    }

    /// Descriptor this cipher was keyed under.
    pub fn session(&self) -> &SymmetricSession {
        &self.session
    }

    /// Total bytes transformed (including filler fed by [`Self::advance`]).
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Apply the keystream to `buf` in place.
    ///
    /// # Errors
    ///
    /// - `KeystreamExhausted` once the cipher's counter would wrap
    pub fn transform_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        self.engine
            .apply(buf)
            .map_err(|_| CryptoError::KeystreamExhausted { processed: self.processed })?;
        self.processed += buf.len() as u64;
        Ok(())
    }

    /// Apply the keystream to a copy of `data`.
    pub fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        self.transform_in_place(&mut out)?;
        Ok(out)
    }

    /// Discard `count` keystream bytes by feeding filler through the cipher.
    pub fn advance(&mut self, count: u64) -> Result<()> {
        let mut filler = [0u8; ADVANCE_CHUNK];
        let mut remaining = count;
        while remaining > 0 {
            let step = remaining.min(ADVANCE_CHUNK as u64) as usize;
            self.transform_in_place(&mut filler[..step])?;
            remaining -= step as u64;
        }
        filler.zeroize();
        Ok(())
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("session", &self.session)
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}
