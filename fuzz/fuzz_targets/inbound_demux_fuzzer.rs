//! Fuzz target for the inbound demultiplexer
//!
//! Feeds a stream of well-formed and corrupted packets split into arbitrary
//! chunks.
//!
//! # Invariants
//!
//! - Nothing below the next expected sequence is inserted
//! - Draining yields strictly increasing sequences
//! - The next expected sequence never moves backwards

#![no_main]

use arbitrary::Arbitrary;
use dtm_core::Inbound;
use dtm_proto::{Packet, PacketClass};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Packet { sequence: u16, service: bool, payload: Vec<u8> },
    Garbage(Vec<u8>),
    Drain,
    GapRequest,
    Resync(u16),
}

fn check_inserted(inbound: &mut Inbound, bytes: &[u8]) {
    let floor = inbound.next_expected();
    for inserted in inbound.ingest(bytes).inserted {
        assert!(inserted >= floor, "stale sequence {inserted} inserted below {floor}");
    }
}

fuzz_target!(|steps: Vec<Step>| {
    let mut inbound = Inbound::new(32, 1 << 16, 4);
    let mut last_expected = inbound.next_expected();
    let mut last_drained: Option<u32> = None;

    for step in steps {
        match step {
            Step::Packet { sequence, service, payload } => {
                let class = if service { PacketClass::Service } else { PacketClass::Message };
                let Ok(bytes) =
                    Packet::build(class, 1, u32::from(sequence), 0, payload).to_bytes()
                else {
                    continue;
                };
                check_inserted(&mut inbound, &bytes);
            },
            Step::Garbage(bytes) => {
                check_inserted(&mut inbound, &bytes);
            },
            Step::Drain => {
                while let Some(packet) = inbound.next_ready() {
                    let sequence = packet.header.sequence();
                    if let Some(previous) = last_drained {
                        assert!(sequence > previous);
                    }
                    last_drained = Some(sequence);
                }
            },
            Step::GapRequest => {
                if let Some(missing) = inbound.gap_request() {
                    assert_eq!(missing, inbound.next_expected());
                }
            },
            Step::Resync(sequence) => {
                inbound.resync_to(u32::from(sequence));
                if let Some(previous) = last_drained {
                    last_drained = Some(previous.max(inbound.next_expected().saturating_sub(1)));
                }
            },
        }
        assert!(inbound.next_expected() >= last_expected);
        last_expected = inbound.next_expected();
    }
});
