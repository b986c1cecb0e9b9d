//! Packet type combining header and payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    PacketClass, PacketHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol packet.
///
/// Layout on the wire: `[PacketHeader: 23 bytes] + [payload: variable]`.
///
/// # Invariants
///
/// - Size Consistency: `payload.len()` matches `header.payload_length()`.
///   Enforced by [`Packet::new`] and verified by [`Packet::decode_prefix`].
/// - The payload is opaque here. It is usually ciphertext, and nothing in this
///   crate looks inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,

    /// Raw payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet with the payload length filled in.
    #[must_use]
    pub fn new(mut header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        // Bytes is bounded by isize::MAX, which always fits an i64
        header.set_payload_length(payload.len() as i64);
        Self { header, payload }
    }

    /// Build a packet from its parts.
    #[must_use]
    pub fn build(
        class: PacketClass,
        flag: u16,
        sequence: u32,
        option: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        let mut header = PacketHeader::new(class, flag);
        header.set_sequence(sequence);
        header.set_option(option);
        Self::new(header, payload)
    }

    /// Size on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Encode into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds
    ///   [`PacketHeader::MAX_PAYLOAD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        debug_assert_eq!(self.payload.len() as i64, self.header.payload_length());

        let size = self.payload.len() as u64;
        if size > PacketHeader::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size, max: PacketHeader::MAX_PAYLOAD_SIZE });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `bytes` using the default payload
    /// limit. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_prefix(bytes, PacketHeader::MAX_PAYLOAD_SIZE).map(|(packet, _)| packet)
    }

    /// Decode one packet from the front of `bytes`, returning it with the
    /// number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderTooShort` if the header is incomplete
    /// - `ProtocolError::UnknownPacketClass` for an unknown class byte
    /// - `ProtocolError::NegativeLength` / `PayloadTooLarge` for insane lengths
    /// - `ProtocolError::Truncated` if the payload is incomplete
    pub fn decode_prefix(bytes: &[u8], max_payload: u64) -> Result<(Self, usize)> {
        let header = *PacketHeader::from_bytes(bytes)?;

        if header.class().is_none() {
            return Err(ProtocolError::UnknownPacketClass(header.class_byte()));
        }

        let declared = header.payload_length();
        if declared < 0 {
            return Err(ProtocolError::NegativeLength(declared));
        }
        if declared as u64 > max_payload {
            return Err(ProtocolError::PayloadTooLarge { size: declared as u64, max: max_payload });
        }

        let expected = declared as usize;
        let available = bytes.len() - PacketHeader::SIZE;
        if available < expected {
            return Err(ProtocolError::Truncated { expected, actual: available });
        }

        let end = PacketHeader::SIZE + expected;
        let payload = Bytes::copy_from_slice(&bytes[PacketHeader::SIZE..end]);
        Ok((Self { header, payload }, end))
    }
}

/// Number of leading bytes of `buf` that form whole packets.
///
/// Stream readers use this to hand the demultiplexer only complete units and
/// keep the tail for the next read. A header whose declared length is negative
/// or above `max_payload` can never complete, so the whole buffer is reported
/// as ready and the demultiplexer's sanity checks reject it.
pub fn complete_prefix(buf: &[u8], max_payload: u64) -> usize {
    let mut offset = 0;
    while let Ok(header) = PacketHeader::from_bytes(&buf[offset..]) {
        let declared = header.payload_length();
        if declared < 0 || declared as u64 > max_payload {
            return buf.len();
        }
        let end = offset + PacketHeader::SIZE + declared as usize;
        if end > buf.len() {
            break;
        }
        offset = end;
    }
    offset
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ServiceFlag;

    fn sample(sequence: u32, payload: &[u8]) -> Packet {
        Packet::build(PacketClass::Message, 1, sequence, 0, payload.to_vec())
    }

    #[test]
    fn new_sets_payload_length() {
        let packet = sample(0, b"hello");
        assert_eq!(packet.header.payload_length(), 5);
        assert_eq!(packet.wire_len(), PacketHeader::SIZE + 5);
    }

    #[test]
    fn decode_prefix_reports_consumed_bytes() {
        let mut buf = Vec::new();
        sample(1, b"abc").encode(&mut buf).unwrap();
        sample(2, b"").encode(&mut buf).unwrap();

        let (first, used) = Packet::decode_prefix(&buf, PacketHeader::MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(first.header.sequence(), 1);
        assert_eq!(used, PacketHeader::SIZE + 3);

        let (second, used2) =
            Packet::decode_prefix(&buf[used..], PacketHeader::MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(second.header.sequence(), 2);
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn decode_rejects_negative_length() {
        let mut header = PacketHeader::new(PacketClass::Service, ServiceFlag::Echo.to_u16());
        header.set_payload_length(-4);
        let bytes = header.to_bytes();
        assert_eq!(Packet::decode(&bytes), Err(ProtocolError::NegativeLength(-4)));
    }

    #[test]
    fn decode_rejects_unknown_class() {
        let mut bytes = sample(0, b"x").to_bytes().unwrap().to_vec();
        bytes[0] = 0x7F;
        assert_eq!(Packet::decode(&bytes), Err(ProtocolError::UnknownPacketClass(0x7F)));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let bytes = sample(0, b"abcdef").to_bytes().unwrap();
        let cut = &bytes[..bytes.len() - 2];
        assert_eq!(Packet::decode(cut), Err(ProtocolError::Truncated { expected: 6, actual: 4 }));
    }

    #[test]
    fn decode_honours_custom_limit() {
        let bytes = sample(0, &[0u8; 64]).to_bytes().unwrap();
        assert_eq!(
            Packet::decode_prefix(&bytes, 32).map(|(p, _)| p),
            Err(ProtocolError::PayloadTooLarge { size: 64, max: 32 })
        );
    }

    #[test]
    fn complete_prefix_stops_at_partial_packet() {
        let mut buf = Vec::new();
        sample(0, b"one").encode(&mut buf).unwrap();
        let whole = buf.len();
        sample(1, b"two").encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert_eq!(complete_prefix(&buf, PacketHeader::MAX_PAYLOAD_SIZE), whole);
        assert_eq!(complete_prefix(&buf[..10], PacketHeader::MAX_PAYLOAD_SIZE), 0);
    }

    #[test]
    fn complete_prefix_forwards_insane_lengths() {
        let mut header = PacketHeader::new(PacketClass::Message, 1);
        header.set_payload_length(i64::MAX);
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(b"junk");
        assert_eq!(complete_prefix(&buf, PacketHeader::MAX_PAYLOAD_SIZE), buf.len());
    }
}
