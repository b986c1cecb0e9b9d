//! Structured payloads carried inside packets, encoded as CBOR.
//!
//! Encryption and padding wrap these encodings; the framer never looks inside.

use dtm_crypto::{KeyMaterial, SecretBytes, SymmetricSession};
use dtm_proto::ProtocolError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::SessionError;

/// Identity as sent during Connect, Init, Auth and Sync.
///
/// Connect carries only the public id and a classification-only parameter id.
/// Init adds the real parameter id and the auth session. Auth adds the secret
/// id. Sync replaces the session with the primary one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IdentityPayload {
    pub public_id: Vec<u8>,
    pub secret_id: SecretBytes,
    pub parameter_id: [u8; 16],
    pub session: Option<SymmetricSession>,
}

/// Forwarding instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyInstruction {
    /// Exchange records for the application's own use
    Forward,
    /// Replace the live channel keys once both records are in place
    Ratchet,
}

impl KeyInstruction {
    /// Code carried in the option field.
    pub fn code(self) -> i64 {
        match self {
            Self::Forward => 1,
            Self::Ratchet => 2,
        }
    }

    /// Decode the option field.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Forward),
            2 => Some(Self::Ratchet),
            _ => None,
        }
    }
}

/// One half of a forward-secrecy key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRecord {
    /// Key and IV
    pub key: KeyMaterial,
    /// Descriptor that keys a cipher from `key`
    pub session: SymmetricSession,
    /// Application-assigned lifetime
    pub lifetime: u64,
    /// What the records are for
    pub instruction: KeyInstruction,
    /// Application-assigned option field
    pub option: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyRequestPayload {
    pub instruction: KeyInstruction,
}

/// A file offered over an ephemeral connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Per-transfer identifier, unique per sender
    pub id: u64,
    /// Proposed file name (no directories)
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
    /// Port of the sender's ephemeral listener
    pub port: u16,
    /// Descriptor for the transfer cipher
    pub session: SymmetricSession,
    /// Key for the transfer cipher
    pub key: KeyMaterial,
}

/// Encode a payload as CBOR.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, SessionError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| SessionError::Protocol(ProtocolError::Encoding(e.to_string())))?;
    Ok(buf)
}

/// Decode a CBOR payload.
pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SessionError> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| SessionError::Protocol(ProtocolError::Encoding(e.to_string())))
}

#[cfg(test)]
mod tests {
    use dtm_crypto::SymmetricCipherKind;

    use super::*;

    #[test]
    fn forward_record_survives_cbor() {
        let session = SymmetricSession::native(SymmetricCipherKind::ChaCha20);
        let record = ForwardRecord {
            key: KeyMaterial::generate(&session, |b| b.fill(7)),
            session,
            lifetime: 3600,
            instruction: KeyInstruction::Ratchet,
            option: -5,
        };
        let bytes = to_cbor(&record).unwrap_or_default();
        let back: Result<ForwardRecord, _> = from_cbor(&bytes);
        assert_eq!(back, Ok(record));
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let back: Result<TransferRequest, _> = from_cbor(&[0xFF, 0x00, 0x13]);
        assert!(matches!(back, Err(SessionError::Protocol(ProtocolError::Encoding(_)))));
    }

    #[test]
    fn instruction_codes_round_trip() {
        for instruction in [KeyInstruction::Forward, KeyInstruction::Ratchet] {
            assert_eq!(KeyInstruction::from_code(instruction.code()), Some(instruction));
        }
        assert_eq!(KeyInstruction::from_code(0), None);
    }
}
