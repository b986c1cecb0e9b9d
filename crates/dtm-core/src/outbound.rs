//! Send side of the reliability layer.
//!
//! Assigns sequence numbers, keeps the verbatim bytes of retransmit-protected
//! frames until the peer echoes them, and answers resend requests.
//!
//! # Invariants
//!
//! - Sequence numbers handed out by [`Outbound::frame`] are consecutive,
//!   starting at 0, with no gaps or repeats
//! - A replayed frame is byte-for-byte the frame first sent, so the peer's
//!   inbound keystream position is unaffected by retransmission
//! - `resend_count() <= max_resend` after every call

use std::collections::BTreeSet;

use bytes::Bytes;
use dtm_proto::{Packet, PacketClass, ServiceFlag};

use crate::{error::SessionError, reorder::ReorderBuffer};

/// Result of a resend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendOutcome {
    /// Stored frame to transmit again
    Replay {
        /// Verbatim frame bytes
        bytes: Bytes,
        /// True when this resend crossed the retransmission bound
        exceeded: bool,
    },
    /// The sequence belonged to an unbuffered service packet; a keepalive at
    /// that sequence lets the peer step over it
    Filler(Bytes),
    /// The frame is gone; the caller must fall back to a resync
    Missing,
    /// The sequence was never sent
    Ignored,
}

/// Outbound sequence counter and retransmit buffer.
#[derive(Debug, Clone)]
pub struct Outbound {
    next_sequence: u32,
    buffer: ReorderBuffer<Bytes>,
    service: BTreeSet<u32>,
    service_capacity: usize,
    resend_count: u32,
    total_resends: u64,
    max_resend: u32,
}

impl Outbound {
    /// Empty outbound state.
    pub fn new(capacity: usize, max_resend: u32) -> Self {
        Self {
            next_sequence: 0,
            buffer: ReorderBuffer::new(capacity),
            service: BTreeSet::new(),
            service_capacity: capacity.max(1),
            resend_count: 0,
            total_resends: 0,
            max_resend,
        }
    }

    /// Frame a packet under the next sequence number.
    ///
    /// Retained frames are kept until acknowledged. Service frames are
    /// remembered by sequence only, so a later resend request for one of them
    /// can be answered with filler.
    ///
    /// # Errors
    ///
    /// - `SessionError::Protocol` if the payload exceeds the frame limit
    pub fn frame(
        &mut self,
        class: PacketClass,
        flag: u16,
        option: i64,
        payload: impl Into<Bytes>,
        retain: bool,
    ) -> Result<(u32, Bytes), SessionError> {
        let sequence = self.next_sequence;
        let bytes = Packet::build(class, flag, sequence, option, payload).to_bytes()?;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        if retain {
            if let Some(evicted) = self.buffer.push(sequence, bytes.clone()) {
                tracing::debug!(evicted, "outbound buffer full, oldest frame dropped");
            }
        } else if class == PacketClass::Service {
            if self.service.len() >= self.service_capacity {
                self.service.pop_first();
            }
            self.service.insert(sequence);
        }
        Ok((sequence, bytes))
    }

    /// Drop an acknowledged frame.
    pub fn acknowledge(&mut self, sequence: u32) {
        self.buffer.destroy(sequence);
    }

    /// Answer a resend request for `sequence`.
    pub fn resend(&mut self, sequence: u32) -> ResendOutcome {
        if sequence >= self.next_sequence {
            return ResendOutcome::Ignored;
        }

        if let Some(bytes) = self.buffer.peek(sequence) {
            let bytes = bytes.clone();
            self.resend_count += 1;
            self.total_resends += 1;
            let exceeded = self.resend_count > self.max_resend;
            if exceeded {
                self.resend_count = 0;
            }
            return ResendOutcome::Replay { bytes, exceeded };
        }

        if self.service.contains(&sequence) {
            let filler = Packet::build(
                PacketClass::Service,
                ServiceFlag::KeepAlive.to_u16(),
                sequence,
                0,
                Bytes::new(),
            );
            return match filler.to_bytes() {
                Ok(bytes) => ResendOutcome::Filler(bytes),
                Err(_) => ResendOutcome::Missing,
            };
        }

        ResendOutcome::Missing
    }

    /// Forget every retained frame. Used after a resync, which makes the old
    /// ciphertext useless to the peer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.service.clear();
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Resends since the last bound crossing.
    pub fn resend_count(&self) -> u32 {
        self.resend_count
    }

    /// Resends over the connection's lifetime.
    pub fn total_resends(&self) -> u64 {
        self.total_resends
    }

    /// Frames awaiting acknowledgment.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
