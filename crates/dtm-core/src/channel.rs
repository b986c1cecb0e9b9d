//! Post-handshake channel ciphers.
//!
//! One cipher per direction: the outbound one keyed with material this side
//! generated, the inbound one with material the peer generated. Each keeps a
//! running count of keystream bytes consumed; the two counts are the ledger a
//! resync compares.

use dtm_crypto::{KeyMaterial, SecretBytes, StreamCipher, SymmetricSession};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    env::Environment,
    error::SessionError,
    params::PaddingProfile,
    payloads::ForwardRecord,
    wrap,
};

/// Key material and descriptor for one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionKey {
    /// Descriptor that keys a cipher from `material`
    pub session: SymmetricSession,
    /// Key and IV
    pub material: KeyMaterial,
}

/// Both live directions of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeys {
    /// Outbound key, generated locally
    pub transmit: DirectionKey,
    /// Inbound key, generated by the peer
    pub receive: DirectionKey,
}

impl ChannelKeys {
    /// Keys from a completed forwarding exchange: our forward record keys the
    /// outbound direction, the peer's returned record the inbound one.
    pub fn from_records(forward: &ForwardRecord, returned: &ForwardRecord) -> Self {
        Self {
            transmit: DirectionKey { session: forward.session, material: forward.key.clone() },
            receive: DirectionKey { session: returned.session, material: returned.key.clone() },
        }
    }

    /// Zero both directions in place.
    pub fn wipe(&mut self) {
        self.transmit.material.wipe();
        self.receive.material.wipe();
    }
}

/// Live ciphers for an established session.
pub(crate) struct Channel {
    keys: ChannelKeys,
    tx: StreamCipher,
    rx: StreamCipher,
}

impl Channel {
    pub(crate) fn new(keys: ChannelKeys) -> Result<Self, SessionError> {
        keys.transmit.session.validate()?;
        keys.receive.session.validate()?;
        let tx = StreamCipher::new(&keys.transmit.session, &keys.transmit.material)?;
        let rx = StreamCipher::new(&keys.receive.session, &keys.receive.material)?;
        Ok(Self { keys, tx, rx })
    }

    /// Replace both ciphers, as a ratchet does.
    pub(crate) fn install(&mut self, keys: ChannelKeys) -> Result<(), SessionError> {
        *self = Self::new(keys)?;
        Ok(())
    }

    /// Pad and encrypt for the peer.
    pub(crate) fn seal<E: Environment>(
        &mut self,
        env: &E,
        plain: &[u8],
        padding: &PaddingProfile,
    ) -> Result<Vec<u8>, SessionError> {
        let mut wrapped = wrap::wrap(env, plain, padding);
        self.tx.transform_in_place(&mut wrapped)?;
        Ok(wrapped)
    }

    /// Decrypt and strip padding.
    pub(crate) fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut buf = Zeroizing::new(sealed.to_vec());
        self.rx.transform_in_place(&mut buf)?;
        wrap::unwrap(&buf)
    }

    /// Realign the inbound keystream for a resync payload and check it.
    ///
    /// `declared_total` is the peer's outbound byte count including the
    /// resync payload itself. The gap between where the peer's keystream
    /// stood before the payload and where ours stands is skipped, then the
    /// payload must decrypt to the peer's known secret id.
    ///
    /// # Errors
    ///
    /// - `SessionError::ResyncFailed` if the gap is negative, the payload does
    ///   not unwrap, or it does not match `expected`
    pub(crate) fn realign(
        &mut self,
        declared_total: i64,
        sealed: &[u8],
        expected: &SecretBytes,
    ) -> Result<u64, SessionError> {
        let received = i128::from(self.rx.processed());
        let gap = i128::from(declared_total) - sealed.len() as i128 - received;
        let gap = u64::try_from(gap).map_err(|_| {
            SessionError::ResyncFailed(format!(
                "peer declared {declared_total} bytes but {received} were already received"
            ))
        })?;

        self.rx.advance(gap)?;
        let plain = self.open(sealed).map_err(|e| SessionError::ResyncFailed(e.to_string()))?;
        if SecretBytes::new(plain) != *expected {
            return Err(SessionError::ResyncFailed(
                "identity mismatch after keystream realignment".to_string(),
            ));
        }
        Ok(gap)
    }

    /// Keystream bytes consumed outbound.
    pub(crate) fn sent_bytes(&self) -> u64 {
        self.tx.processed()
    }

    /// Keystream bytes consumed inbound.
    pub(crate) fn received_bytes(&self) -> u64 {
        self.rx.processed()
    }

    pub(crate) fn keys(&self) -> &ChannelKeys {
        &self.keys
    }

    pub(crate) fn into_keys(self) -> ChannelKeys {
        self.keys
    }
}

#[cfg(test)]
mod tests {
    use dtm_crypto::SymmetricCipherKind;

    use super::*;
    use crate::env::test_env::TestEnv;

    fn keys(env: &TestEnv) -> ChannelKeys {
        let session = SymmetricSession::native(SymmetricCipherKind::ChaCha20);
        ChannelKeys {
            transmit: DirectionKey {
                session,
                material: KeyMaterial::generate(&session, |b| env.random_bytes(b)),
            },
            receive: DirectionKey {
                session,
                material: KeyMaterial::generate(&session, |b| env.random_bytes(b)),
            },
        }
    }

    fn mirrored(keys: &ChannelKeys) -> ChannelKeys {
        ChannelKeys { transmit: keys.receive.clone(), receive: keys.transmit.clone() }
    }

    fn channels() -> (TestEnv, Channel, Channel) {
        let env = TestEnv::seeded(11);
        let a = keys(&env);
        let b = mirrored(&a);
        let a = Channel::new(a).unwrap_or_else(|e| panic!("{e}"));
        let b = Channel::new(b).unwrap_or_else(|e| panic!("{e}"));
        (env, a, b)
    }

    #[test]
    fn seal_then_open() {
        let (env, mut a, mut b) = channels();
        let padding = PaddingProfile::symmetric(0, 16);
        for message in [&b"first"[..], &b""[..], &b"third message"[..]] {
            let sealed = a.seal(&env, message, &padding).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(b.open(&sealed), Ok(message.to_vec()));
        }
        assert_eq!(a.sent_bytes(), b.received_bytes());
    }

    #[test]
    fn realign_skips_lost_ciphertext() {
        let (env, mut a, mut b) = channels();
        let secret = SecretBytes::from_slice(b"alice-secret");

        let _lost = a.seal(&env, b"never arrives", &PaddingProfile::NONE);
        let resync =
            a.seal(&env, secret.as_bytes(), &PaddingProfile::NONE).unwrap_or_else(|e| panic!("{e}"));
        let declared = a.sent_bytes() as i64;

        let gap = b.realign(declared, &resync, &secret).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(gap, 13 + 12);
        assert_eq!(a.sent_bytes(), b.received_bytes());

        let sealed = a.seal(&env, b"after", &PaddingProfile::NONE).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(b.open(&sealed), Ok(b"after".to_vec()));
    }

    #[test]
    fn negative_gap_fails() {
        let (env, mut a, mut b) = channels();
        let secret = SecretBytes::from_slice(b"s");
        let sealed = a.seal(&env, b"delivered", &PaddingProfile::NONE).unwrap_or_else(|e| panic!("{e}"));
        b.open(&sealed).unwrap_or_else(|e| panic!("{e}"));

        let resync = a.seal(&env, secret.as_bytes(), &PaddingProfile::NONE).unwrap_or_else(|e| panic!("{e}"));
        let understated = a.sent_bytes() as i64 - 5;
        let result = b.realign(understated, &resync, &secret);
        assert!(matches!(result, Err(SessionError::ResyncFailed(_))));
    }

    #[test]
    fn wrong_position_fails_identity_check() {
        let (env, mut a, mut b) = channels();
        let secret = SecretBytes::from_slice(b"alice-secret");
        let _lost = a.seal(&env, b"lost", &PaddingProfile::NONE);
        let resync = a.seal(&env, secret.as_bytes(), &PaddingProfile::NONE).unwrap_or_else(|e| panic!("{e}"));

        let overstated = a.sent_bytes() as i64 + 3;
        let result = b.realign(overstated, &resync, &secret);
        assert!(matches!(result, Err(SessionError::ResyncFailed(_))));
    }

    #[test]
    fn install_resets_the_ledger() {
        let (env, mut a, _) = channels();
        a.seal(&env, b"x", &PaddingProfile::NONE).unwrap_or_else(|e| panic!("{e}"));
        let fresh = keys(&env);
        a.install(fresh.clone()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.sent_bytes(), 0);
        assert_eq!(a.keys(), &fresh);
    }

    #[test]
    fn records_map_to_directions() {
        let session = SymmetricSession::native(SymmetricCipherKind::ChaCha8);
        let record = |fill: u8| ForwardRecord {
            key: KeyMaterial::generate(&session, |b| b.fill(fill)),
            session,
            lifetime: 0,
            instruction: crate::payloads::KeyInstruction::Ratchet,
            option: 0,
        };
        let (forward, returned) = (record(1), record(2));
        let keys = ChannelKeys::from_records(&forward, &returned);
        assert_eq!(keys.transmit.material, forward.key);
        assert_eq!(keys.receive.material, returned.key);

        let mut keys = keys;
        keys.wipe();
        assert!(keys.transmit.material.is_zeroed() && keys.receive.material.is_zeroed());
    }
}
