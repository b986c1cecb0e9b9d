//! Property-based tests for packet framing
//!
//! Verifies that encoding is lossless and that stream boundary detection
//! finds exactly the packets that were concatenated, whatever their sizes.

use bytes::Bytes;
use dtm_proto::{Packet, PacketClass, PacketHeader, complete_prefix};
use proptest::prelude::*;

fn arbitrary_class() -> impl Strategy<Value = PacketClass> {
    prop_oneof![
        Just(PacketClass::Exchange),
        Just(PacketClass::Message),
        Just(PacketClass::Service),
        Just(PacketClass::Transfer),
        Just(PacketClass::Forwarding),
    ]
}

fn arbitrary_packet() -> impl Strategy<Value = Packet> {
    (
        arbitrary_class(),
        any::<u16>(),
        any::<u32>(),
        any::<i64>(),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(class, flag, sequence, option, payload)| {
            Packet::build(class, flag, sequence, option, Bytes::from(payload))
        })
}

#[test]
fn prop_packet_encode_decode_roundtrip() {
    proptest!(|(packet in arbitrary_packet())| {
        let mut buf = Vec::new();
        packet.encode(&mut buf).expect("encode should succeed");
        prop_assert_eq!(buf.len(), packet.wire_len());

        let decoded = Packet::decode(&buf).expect("decode should succeed");
        prop_assert_eq!(decoded, packet);
    });
}

#[test]
fn prop_concatenated_packets_are_fully_ready() {
    proptest!(|(packets in prop::collection::vec(arbitrary_packet(), 1..8))| {
        let mut buf = Vec::new();
        for packet in &packets {
            packet.encode(&mut buf).expect("encode should succeed");
        }

        prop_assert_eq!(complete_prefix(&buf, PacketHeader::MAX_PAYLOAD_SIZE), buf.len());

        let mut offset = 0;
        let mut decoded = Vec::new();
        while offset < buf.len() {
            let (packet, used) = Packet::decode_prefix(&buf[offset..], PacketHeader::MAX_PAYLOAD_SIZE)
                .expect("decode should succeed");
            decoded.push(packet);
            offset += used;
        }
        prop_assert_eq!(decoded, packets);
    });
}

#[test]
fn prop_split_stream_reports_only_whole_packets() {
    proptest!(|(
        packets in prop::collection::vec(arbitrary_packet(), 1..6),
        cut in any::<prop::sample::Index>(),
    )| {
        let mut buf = Vec::new();
        let mut boundaries = vec![0];
        for packet in &packets {
            packet.encode(&mut buf).expect("encode should succeed");
            boundaries.push(buf.len());
        }

        let cut = cut.index(buf.len() + 1);
        let ready = complete_prefix(&buf[..cut], PacketHeader::MAX_PAYLOAD_SIZE);

        // The ready prefix is the largest packet boundary not past the cut
        let expected = boundaries.iter().copied().filter(|b| *b <= cut).max().unwrap_or(0);
        prop_assert_eq!(ready, expected);
    });
}

#[test]
fn prop_garbage_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..256))| {
        let _ = Packet::decode(&bytes);
        let ready = complete_prefix(&bytes, PacketHeader::MAX_PAYLOAD_SIZE);
        prop_assert!(ready <= bytes.len());
    });
}
