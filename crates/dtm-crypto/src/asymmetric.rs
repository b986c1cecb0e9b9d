//! Post-quantum asymmetric encryption (ML-KEM + XChaCha20-Poly1305).
//!
//! ML-KEM is a key encapsulation mechanism, not an encryption scheme, so
//! `encrypt` is a KEM/DEM construction: encapsulate against the public key,
//! expand the shared secret with HKDF-SHA256 into an AEAD key and nonce, and
//! seal the plaintext. The wire form is `kem_ciphertext || aead_ciphertext`.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    SecretBytes,
    error::{CryptoError, Result},
    kdf::{self, KdfDigest},
};

/// HKDF info label for the hybrid AEAD key
const HYBRID_LABEL: &[u8] = b"dtmHybridKemV1";

/// AEAD key (32) + XChaCha nonce (24)
const HYBRID_OKM_SIZE: usize = 56;

/// Poly1305 tag size
const TAG_SIZE: usize = 16;

/// ML-KEM security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsymmetricAlgorithm {
    /// ML-KEM-512 (category 1)
    MlKem512,
    /// ML-KEM-768 (category 3)
    MlKem768,
    /// ML-KEM-1024 (category 5)
    MlKem1024,
}

/// A public key tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Producing algorithm
    pub algorithm: AsymmetricAlgorithm,
    /// Encoded encapsulation key
    pub bytes: Vec<u8>,
}

/// A key pair whose private half is wiped on drop.
#[derive(Debug, Clone)]
pub struct AsymmetricKeyPair {
    /// Public half
    pub public: PublicKey,
    /// Encoded decapsulation key
    pub secret: SecretBytes,
}

impl AsymmetricKeyPair {
    /// Algorithm of this pair.
    pub fn algorithm(&self) -> AsymmetricAlgorithm {
        self.public.algorithm
    }

    /// Zero the private half in place.
    pub fn wipe(&mut self) {
        self.secret.wipe();
    }
}

/// Asymmetric encryption contract used by the handshake.
pub trait AsymmetricCipher {
    /// Generate a fresh key pair.
    fn generate_key_pair(&self) -> Result<AsymmetricKeyPair>;

    /// Encrypt `plaintext` to `public`.
    fn encrypt(&self, public: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext` with `pair`.
    fn decrypt(&self, pair: &AsymmetricKeyPair, ciphertext: &[u8]) -> Result<SecretBytes>;
}

macro_rules! ml_kem_binding {
    ($module:ident, $name:literal) => {
        mod $module {
            use fips203::{
                $module as kem,
                traits::{Decaps, Encaps, KeyGen, SerDes},
            };
            use zeroize::Zeroize;

            use crate::{
                SecretBytes,
                error::{CryptoError, Result},
            };

            pub(super) const CIPHERTEXT_LEN: usize = kem::CT_LEN;

            pub(super) fn keygen() -> Result<(Vec<u8>, SecretBytes)> {
                let (ek, dk) = kem::KG::try_keygen()
                    .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
                let mut dk_bytes = dk.into_bytes();
                let secret = SecretBytes::from_slice(&dk_bytes);
                dk_bytes.zeroize();
                Ok((ek.into_bytes().to_vec(), secret))
            }

            pub(super) fn encapsulate(public: &[u8]) -> Result<(SecretBytes, Vec<u8>)> {
                let arr: [u8; kem::EK_LEN] = public
                    .try_into()
                    .map_err(|_| CryptoError::InvalidPublicKey { algorithm: $name })?;
                let ek = kem::EncapsKey::try_from_bytes(arr)
                    .map_err(|_| CryptoError::InvalidPublicKey { algorithm: $name })?;
                let (ssk, ct) = ek
                    .try_encaps()
                    .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
                let mut shared = ssk.into_bytes();
                let secret = SecretBytes::from_slice(&shared);
                shared.zeroize();
                Ok((secret, ct.into_bytes().to_vec()))
            }

            pub(super) fn decapsulate(secret: &[u8], ciphertext: &[u8]) -> Result<SecretBytes> {
                let mut dk_arr: [u8; kem::DK_LEN] = secret.try_into().map_err(|_| {
                    CryptoError::InvalidKeyLength { expected: kem::DK_LEN, actual: secret.len() }
                })?;
                let dk = kem::DecapsKey::try_from_bytes(dk_arr);
                dk_arr.zeroize();
                let dk = dk.map_err(|e| CryptoError::DecryptionFailed { reason: e.to_string() })?;

                let ct_arr: [u8; kem::CT_LEN] = ciphertext.try_into().map_err(|_| {
                    CryptoError::InvalidCiphertext {
                        reason: format!("expected {} byte KEM ciphertext", kem::CT_LEN),
                    }
                })?;
                let ct = kem::CipherText::try_from_bytes(ct_arr)
                    .map_err(|e| CryptoError::InvalidCiphertext { reason: e.to_string() })?;
                let ssk = dk
                    .try_decaps(&ct)
                    .map_err(|e| CryptoError::DecryptionFailed { reason: e.to_string() })?;
                let mut shared = ssk.into_bytes();
                let secret = SecretBytes::from_slice(&shared);
                shared.zeroize();
                Ok(secret)
            }
        }
    };
}

ml_kem_binding!(ml_kem_512, "ML-KEM-512");
ml_kem_binding!(ml_kem_768, "ML-KEM-768");
ml_kem_binding!(ml_kem_1024, "ML-KEM-1024");

impl AsymmetricAlgorithm {
    /// Identifier used in parameter-set ids.
    pub const fn id(self) -> u32 {
        match self {
            Self::MlKem512 => 1,
            Self::MlKem768 => 2,
            Self::MlKem1024 => 3,
        }
    }

    /// Resolve an identifier.
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(Self::MlKem512),
            2 => Ok(Self::MlKem768),
            3 => Ok(Self::MlKem1024),
            other => {
                Err(CryptoError::UnsupportedDescriptor(format!("unknown asymmetric id {other}")))
            },
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MlKem512 => "ML-KEM-512",
            Self::MlKem768 => "ML-KEM-768",
            Self::MlKem1024 => "ML-KEM-1024",
        }
    }

    fn kem_ciphertext_len(self) -> usize {
        match self {
            Self::MlKem512 => ml_kem_512::CIPHERTEXT_LEN,
            Self::MlKem768 => ml_kem_768::CIPHERTEXT_LEN,
            Self::MlKem1024 => ml_kem_1024::CIPHERTEXT_LEN,
        }
    }

    fn encapsulate(self, public: &[u8]) -> Result<(SecretBytes, Vec<u8>)> {
        match self {
            Self::MlKem512 => ml_kem_512::encapsulate(public),
            Self::MlKem768 => ml_kem_768::encapsulate(public),
            Self::MlKem1024 => ml_kem_1024::encapsulate(public),
        }
    }

    fn decapsulate(self, secret: &[u8], ciphertext: &[u8]) -> Result<SecretBytes> {
        match self {
            Self::MlKem512 => ml_kem_512::decapsulate(secret, ciphertext),
            Self::MlKem768 => ml_kem_768::decapsulate(secret, ciphertext),
            Self::MlKem1024 => ml_kem_1024::decapsulate(secret, ciphertext),
        }
    }
}

fn hybrid_cipher(shared: &SecretBytes) -> Result<(XChaCha20Poly1305, [u8; 24])> {
    let mut okm = [0u8; HYBRID_OKM_SIZE];
    kdf::expand(KdfDigest::Sha256, shared.as_bytes(), &[], HYBRID_LABEL, &mut okm)?;

    let mut key = [0u8; 32];
    let mut nonce = [0u8; 24];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    okm.zeroize();

    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();
    Ok((cipher, nonce))
}

impl AsymmetricCipher for AsymmetricAlgorithm {
    fn generate_key_pair(&self) -> Result<AsymmetricKeyPair> {
        let (public, secret) = match self {
            Self::MlKem512 => ml_kem_512::keygen()?,
            Self::MlKem768 => ml_kem_768::keygen()?,
            Self::MlKem1024 => ml_kem_1024::keygen()?,
        };
        Ok(AsymmetricKeyPair { public: PublicKey { algorithm: *self, bytes: public }, secret })
    }

    fn encrypt(&self, public: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        if public.algorithm != *self {
            return Err(CryptoError::InvalidPublicKey { algorithm: self.name() });
        }

        let (shared, kem_ct) = self.encapsulate(&public.bytes)?;
        let (cipher, nonce) = hybrid_cipher(&shared)?;

        let Ok(sealed) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        let mut out = Vec::with_capacity(kem_ct.len() + sealed.len());
        out.extend_from_slice(&kem_ct);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, pair: &AsymmetricKeyPair, ciphertext: &[u8]) -> Result<SecretBytes> {
        if pair.algorithm() != *self {
            return Err(CryptoError::InvalidPublicKey { algorithm: self.name() });
        }

        let kem_len = self.kem_ciphertext_len();
        if ciphertext.len() < kem_len + TAG_SIZE {
            return Err(CryptoError::InvalidCiphertext {
                reason: format!(
                    "{} bytes is shorter than the {} byte minimum",
                    ciphertext.len(),
                    kem_len + TAG_SIZE
                ),
            });
        }

        let (kem_ct, sealed) = ciphertext.split_at(kem_len);
        let shared = self.decapsulate(pair.secret.as_bytes(), kem_ct)?;
        let (cipher, nonce) = hybrid_cipher(&shared)?;

        cipher
            .decrypt(XNonce::from_slice(&nonce), sealed)
            .map(SecretBytes::new)
            .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AsymmetricAlgorithm; 3] = [
        AsymmetricAlgorithm::MlKem512,
        AsymmetricAlgorithm::MlKem768,
        AsymmetricAlgorithm::MlKem1024,
    ];

    fn keypair(algorithm: AsymmetricAlgorithm) -> AsymmetricKeyPair {
        algorithm.generate_key_pair().unwrap_or_else(|e| panic!("keygen: {e}"))
    }

    #[test]
    fn hybrid_round_trip_for_every_level() {
        for algorithm in ALL {
            let pair = keypair(algorithm);
            let ct = algorithm
                .encrypt(&pair.public, b"session key material")
                .unwrap_or_else(|e| panic!("encrypt: {e}"));
            assert_eq!(ct.len(), algorithm.kem_ciphertext_len() + 20 + TAG_SIZE);

            let pt = algorithm.decrypt(&pair, &ct).unwrap_or_else(|e| panic!("decrypt: {e}"));
            assert_eq!(pt.as_bytes(), b"session key material");
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let algorithm = AsymmetricAlgorithm::MlKem768;
        let pair = keypair(algorithm);
        let mut ct = algorithm.encrypt(&pair.public, b"secret").unwrap_or_default();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(algorithm.decrypt(&pair, &ct), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn wrong_key_pair_fails() {
        let algorithm = AsymmetricAlgorithm::MlKem512;
        let alice = keypair(algorithm);
        let mallory = keypair(algorithm);
        let ct = algorithm.encrypt(&alice.public, b"for alice").unwrap_or_default();
        assert!(algorithm.decrypt(&mallory, &ct).is_err());
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let algorithm = AsymmetricAlgorithm::MlKem512;
        let pair = keypair(algorithm);
        assert!(matches!(
            algorithm.decrypt(&pair, &[0u8; 10]),
            Err(CryptoError::InvalidCiphertext { .. })
        ));
    }

    #[test]
    fn algorithm_mismatch_is_rejected() {
        let pair = keypair(AsymmetricAlgorithm::MlKem512);
        assert!(matches!(
            AsymmetricAlgorithm::MlKem1024.encrypt(&pair.public, b"x"),
            Err(CryptoError::InvalidPublicKey { .. })
        ));
    }

    #[test]
    fn garbage_public_key_is_rejected() {
        let public = PublicKey { algorithm: AsymmetricAlgorithm::MlKem512, bytes: vec![1, 2, 3] };
        assert!(AsymmetricAlgorithm::MlKem512.encrypt(&public, b"x").is_err());
    }

    #[test]
    fn ids_round_trip() {
        for algorithm in ALL {
            assert_eq!(AsymmetricAlgorithm::from_id(algorithm.id()), Ok(algorithm));
        }
        assert!(AsymmetricAlgorithm::from_id(0).is_err());
    }
}
