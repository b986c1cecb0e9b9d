//! Fuzz target for header boundary conditions
//!
//! # Invariants
//!
//! - Negative declared lengths MUST return `ProtocolError::NegativeLength`
//! - Lengths above the limit MUST return `ProtocolError::PayloadTooLarge`
//! - Unknown class bytes MUST return `ProtocolError::UnknownPacketClass`
//! - A packet that decodes re-encodes to the same bytes

#![no_main]

use arbitrary::Arbitrary;
use dtm_proto::{Packet, PacketClass, PacketHeader, ProtocolError};
use libfuzzer_sys::fuzz_target;

const LIMIT: u64 = 4096;

#[derive(Debug, Clone, Arbitrary)]
enum Length {
    Exact,
    Zero,
    Negative(i64),
    AtLimit,
    JustOver,
    Max,
    Random(i64),
}

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryPacket {
    class: u8,
    length: Length,
    sequence: u32,
    flag: u16,
    option: i64,
    payload: Vec<u8>,
}

fuzz_target!(|input: BoundaryPacket| {
    let mut payload = input.payload;
    payload.truncate(LIMIT as usize);

    let declared = match input.length {
        Length::Exact => payload.len() as i64,
        Length::Zero => 0,
        Length::Negative(n) => -(n.unsigned_abs().clamp(1, i64::MAX as u64) as i64),
        Length::AtLimit => LIMIT as i64,
        Length::JustOver => LIMIT as i64 + 1,
        Length::Max => i64::MAX,
        Length::Random(n) => n,
    };

    let mut bytes = Vec::with_capacity(PacketHeader::SIZE + payload.len());
    bytes.push(input.class);
    bytes.extend_from_slice(&declared.to_be_bytes());
    bytes.extend_from_slice(&input.sequence.to_be_bytes());
    bytes.extend_from_slice(&input.flag.to_be_bytes());
    bytes.extend_from_slice(&input.option.to_be_bytes());
    bytes.extend_from_slice(&payload);

    let result = Packet::decode_prefix(&bytes, LIMIT);
    if PacketClass::from_u8(input.class).is_none() {
        assert_eq!(result.err(), Some(ProtocolError::UnknownPacketClass(input.class)));
        return;
    }
    if declared < 0 {
        assert_eq!(result.err(), Some(ProtocolError::NegativeLength(declared)));
        return;
    }
    if declared as u64 > LIMIT {
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
        return;
    }

    match result {
        Ok((packet, used)) => {
            assert_eq!(used, PacketHeader::SIZE + declared as usize);
            assert_eq!(packet.header.sequence(), input.sequence);
            assert_eq!(packet.header.flag(), input.flag);
            assert_eq!(packet.header.option(), input.option);
            let encoded = packet.to_bytes().expect("decoded packet re-encodes");
            assert_eq!(&encoded[..], &bytes[..used]);
        },
        Err(error) => {
            assert!(declared as usize > payload.len());
            assert!(matches!(error, ProtocolError::Truncated { .. }));
        },
    }
});
