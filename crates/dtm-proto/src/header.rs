//! Packet header with zero-copy parsing.
//!
//! The header is a fixed 23-byte structure serialized as raw big-endian
//! binary. Its size is a protocol constant: both peers must agree on it out of
//! band, because the length field is the only thing that tells a reader where
//! the next packet starts.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{
    PacketClass,
    errors::{ProtocolError, Result},
};

/// Fixed 23-byte packet header (big endian).
///
/// Layout: `class (1) | payload_length (8) | sequence (4) | flag (2) |
/// option (8)`.
///
/// # Security
///
/// The `#[repr(C, packed)]` layout with zerocopy traits makes every 23-byte
/// pattern a valid header, so casting untrusted network bytes cannot cause
/// undefined behavior. Parsing checks only that enough bytes are present;
/// class, length and sequence sanity are judged by the caller.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    class: u8,
    payload_length: [u8; 8], // i64
    sequence: [u8; 4],       // u32
    flag: [u8; 2],           // u16, meaning depends on class
    option: [u8; 8],         // i64, meaning depends on class and flag
}

impl PacketHeader {
    /// Size of the serialized header
    pub const SIZE: usize = 23;

    /// Default upper bound on a declared payload length (16 MiB)
    pub const MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

    /// Create a header for `class` with sub-type `flag`.
    ///
    /// Length, sequence and option start at zero.
    #[must_use]
    pub fn new(class: PacketClass, flag: u16) -> Self {
        let mut header = Self::new_zeroed();
        header.class = class.to_u8();
        header.flag = flag.to_be_bytes();
        header
    }

    /// Parse a header from the front of `bytes` (zero-copy).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderTooShort` if fewer than [`Self::SIZE`] bytes
    ///   are available
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| ProtocolError::HeaderTooShort { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Serialize header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Raw class byte.
    #[must_use]
    pub fn class_byte(&self) -> u8 {
        self.class
    }

    /// Packet class. `None` if unrecognized.
    #[must_use]
    pub fn class(&self) -> Option<PacketClass> {
        PacketClass::from_u8(self.class)
    }

    /// Declared payload length. Untrusted: may be negative or huge.
    #[must_use]
    pub fn payload_length(&self) -> i64 {
        i64::from_be_bytes(self.payload_length)
    }

    /// Per-direction sequence number.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        u32::from_be_bytes(self.sequence)
    }

    /// Class-specific sub-type flag.
    #[must_use]
    pub fn flag(&self) -> u16 {
        u16::from_be_bytes(self.flag)
    }

    /// Class-specific option field.
    #[must_use]
    pub fn option(&self) -> i64 {
        i64::from_be_bytes(self.option)
    }

    /// Set the declared payload length.
    pub fn set_payload_length(&mut self, length: i64) {
        self.payload_length = length.to_be_bytes();
    }

    /// Assign the sequence number.
    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence.to_be_bytes();
    }

    /// Set the sub-type flag.
    pub fn set_flag(&mut self, flag: u16) {
        self.flag = flag.to_be_bytes();
    }

    /// Set the option field.
    pub fn set_option(&mut self, option: i64) {
        self.option = option.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("PacketHeader");
        match self.class() {
            Some(class) => s.field("class", &class),
            None => s.field("class", &format!("{:#04x}", self.class)),
        };
        s.field("payload_length", &self.payload_length())
            .field("sequence", &self.sequence())
            .field("flag", &self.flag())
            .field("option", &self.option())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PacketHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn layout_is_big_endian_in_declared_order() {
        let mut header = PacketHeader::new(PacketClass::Service, 0x0102);
        header.set_payload_length(0x0A0B);
        header.set_sequence(7);
        header.set_option(-1);

        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..9], &0x0A0Bi64.to_be_bytes());
        assert_eq!(&bytes[9..13], &[0, 0, 0, 7]);
        assert_eq!(&bytes[13..15], &[0x01, 0x02]);
        assert_eq!(&bytes[15..23], &[0xFF; 8]);
    }

    #[test]
    fn sequence_reads_unsigned() {
        let mut bytes = [0u8; PacketHeader::SIZE];
        bytes[0] = 2;
        bytes[9..13].copy_from_slice(&[0x80, 0, 0, 1]);
        let sequence = PacketHeader::from_bytes(&bytes).map(PacketHeader::sequence);
        assert_eq!(sequence, Ok(0x8000_0001));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let bytes = [0u8; PacketHeader::SIZE - 1];
        assert_eq!(
            PacketHeader::from_bytes(&bytes).err(),
            Some(ProtocolError::HeaderTooShort { expected: 23, actual: 22 })
        );
    }

    proptest! {
        #[test]
        fn any_23_bytes_parse(bytes in prop::collection::vec(any::<u8>(), PacketHeader::SIZE)) {
            let header = PacketHeader::from_bytes(&bytes).map(|h| h.to_bytes());
            prop_assert_eq!(header.ok().map(|b| b.to_vec()), Some(bytes));
        }

        #[test]
        fn setters_round_trip(len in any::<i64>(), seq in any::<u32>(), flag in any::<u16>(), option in any::<i64>()) {
            let mut header = PacketHeader::new(PacketClass::Message, flag);
            header.set_payload_length(len);
            header.set_sequence(seq);
            header.set_option(option);

            let bytes = header.to_bytes();
            let parsed = PacketHeader::from_bytes(&bytes).map(|h| *h);
            prop_assert_eq!(parsed, Ok(header));
            prop_assert_eq!(header.payload_length(), len);
            prop_assert_eq!(header.sequence(), seq);
            prop_assert_eq!(header.flag(), flag);
            prop_assert_eq!(header.option(), option);
        }
    }
}
