//! Demultiplexing and padding properties.

use bytes::{Bytes, BytesMut};
use dtm_core::{Inbound, ParameterRegistry, wrap};
use dtm_harness::SimEnv;
use dtm_proto::{MessageFlag, Packet, PacketClass, ServiceFlag};
use proptest::prelude::*;

const MAX_PAYLOAD: u64 = 1 << 20;

fn frame(sequence: u32, service: bool, payload: Vec<u8>) -> Bytes {
    let (class, flag) = if service {
        (PacketClass::Service, ServiceFlag::KeepAlive.to_u16())
    } else {
        (PacketClass::Message, MessageFlag::Transmission.to_u16())
    };
    Packet::build(class, flag, sequence, 0, payload).to_bytes().unwrap()
}

fn arb_frames() -> impl Strategy<Value = Vec<(bool, Vec<u8>)>> {
    prop::collection::vec((prop::bool::weighted(0.2), prop::collection::vec(any::<u8>(), 0..200)), 1..24)
}

#[test]
fn one_chunk_of_many_packets_inserts_each_once() {
    for count in [1u32, 2, 5] {
        let mut chunk = BytesMut::new();
        for sequence in 0..count {
            chunk.extend_from_slice(&frame(sequence, false, vec![sequence as u8; 9]));
        }
        let mut inbound = Inbound::new(64, MAX_PAYLOAD, 10);
        let demuxed = inbound.ingest(&chunk);

        assert_eq!(demuxed.inserted, (0..count).collect::<Vec<_>>());
        assert!(demuxed.violation.is_none() && demuxed.resend.is_empty());
        assert_eq!(inbound.ingest(&chunk).inserted, Vec::<u32>::new(), "replayed chunk re-inserted");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn shuffled_chunks_drain_in_sequence_order(
        frames in arb_frames(),
        order in any::<prop::sample::Index>(),
        split in any::<prop::sample::Index>(),
    ) {
        let total = frames.len();
        let mut packets: Vec<(u32, bool, Bytes)> = frames
            .into_iter()
            .enumerate()
            .map(|(i, (service, payload))| (i as u32, service, frame(i as u32, service, payload)))
            .collect();
        packets.rotate_left(order.index(total));

        let cut = split.index(total + 1);
        let mut inbound = Inbound::new(64, MAX_PAYLOAD, 1_000);
        let mut inserted = Vec::new();
        let mut service = Vec::new();
        for part in [&packets[..cut], &packets[cut..]] {
            let mut chunk = BytesMut::new();
            for (_, _, bytes) in part {
                chunk.extend_from_slice(bytes);
            }
            let demuxed = inbound.ingest(&chunk);
            prop_assert!(demuxed.violation.is_none());
            inserted.extend(demuxed.inserted);
            service.extend(demuxed.service.iter().map(|p| p.header.sequence()));
        }

        let expected_inserted: Vec<u32> =
            packets.iter().filter(|(_, s, _)| !*s).map(|(seq, _, _)| *seq).collect();
        let expected_service: Vec<u32> =
            packets.iter().filter(|(_, s, _)| *s).map(|(seq, _, _)| *seq).collect();
        prop_assert_eq!(&inserted, &expected_inserted);
        prop_assert_eq!(&service, &expected_service);

        let mut drained = Vec::new();
        while let Some(packet) = inbound.next_ready() {
            drained.push(packet.header.sequence());
        }
        let mut sorted = expected_inserted.clone();
        sorted.sort_unstable();
        prop_assert_eq!(drained, sorted);
        prop_assert_eq!(inbound.next_expected(), total as u32);
    }

    #[test]
    fn every_bundle_padding_round_trips(
        seed in any::<u64>(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let env = SimEnv::with_seed(seed);
        for bundle in ParameterRegistry::all() {
            let wrapped = wrap::wrap(&env, &payload, &bundle.message_padding);
            prop_assert!(wrapped.len() >= payload.len() + bundle.message_padding.prepend.min);
            prop_assert_eq!(wrap::unwrap(&wrapped).unwrap(), payload.clone());
        }
    }
}

#[test]
fn truncated_tail_is_reported_and_requested() {
    let mut chunk = BytesMut::new();
    chunk.extend_from_slice(&frame(0, false, b"whole".to_vec()));
    let second = frame(1, false, b"cut short".to_vec());
    chunk.extend_from_slice(&second[..second.len() - 3]);

    let mut inbound = Inbound::new(64, MAX_PAYLOAD, 10);
    let demuxed = inbound.ingest(&chunk);
    assert_eq!(demuxed.inserted, vec![0]);
    assert!(demuxed.violation.is_some());
    assert_eq!(demuxed.resend, vec![1]);
}
