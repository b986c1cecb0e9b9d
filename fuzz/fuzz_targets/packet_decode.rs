//! Fuzz target for Packet::decode and complete_prefix
//!
//! Arbitrary bytes must never panic the framer. Anything `complete_prefix`
//! reports as whole must decode packet by packet to exactly that length.

#![no_main]

use dtm_proto::{Packet, PacketHeader, complete_prefix};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Packet::decode(data);

    let ready = complete_prefix(data, PacketHeader::MAX_PAYLOAD_SIZE);
    assert!(ready <= data.len());

    let mut offset = 0;
    while offset < ready {
        match Packet::decode_prefix(&data[offset..ready], PacketHeader::MAX_PAYLOAD_SIZE) {
            Ok((packet, used)) => {
                assert_eq!(used, packet.wire_len());
                offset += used;
            },
            // Oversized or negative lengths mark the whole buffer ready so the
            // demultiplexer rejects it.
            Err(_) => break,
        }
    }
    assert!(offset <= ready);
});
