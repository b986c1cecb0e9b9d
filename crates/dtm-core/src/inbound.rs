//! Receive side of the reliability layer: demultiplexing, reordering and loss
//! detection.
//!
//! The transport may coalesce or split frames arbitrarily. [`Inbound::ingest`]
//! walks a chunk frame by frame, sanity-checking each header before slicing
//! out its payload. Frames wait in the reorder buffer until every lower
//! sequence number has been consumed.
//!
//! Service frames are handed back immediately rather than buffered; their
//! sequence numbers are remembered so in-order consumption can step over them.
//!
//! # Invariants
//!
//! - [`Inbound::next_ready`] yields non-service packets in strictly increasing
//!   sequence order with no gaps other than service sequences
//! - A sequence below the next expected one is never accepted twice
//! - A resend request is issued at most once per stalled position unless the
//!   lead grows by another full threshold
//! - The highest sequence seen only moves for chunks that demultiplex
//!   cleanly. Frames ahead of a violation are still buffered.

use std::collections::BTreeSet;

use dtm_proto::{Packet, PacketClass, ProtocolError};

use crate::reorder::ReorderBuffer;

/// What one chunk contributed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demuxed {
    /// Sequence numbers inserted into the reorder buffer, in chunk order
    pub inserted: Vec<u32>,
    /// Service packets, in chunk order
    pub service: Vec<Packet>,
    /// Sequence numbers to request from the peer
    pub resend: Vec<u32>,
    /// Framing error that cut the chunk short
    pub violation: Option<ProtocolError>,
}

/// Inbound sequence tracking and reorder buffer.
#[derive(Debug, Clone)]
pub struct Inbound {
    next: u32,
    highest_seen: Option<u32>,
    buffer: ReorderBuffer<Packet>,
    skipped: BTreeSet<u32>,
    last_gap_request: Option<(u32, u32)>,
    max_payload: u64,
    threshold: u32,
}

impl Inbound {
    /// Empty inbound state expecting sequence 0.
    pub fn new(capacity: usize, max_payload: u64, threshold: u32) -> Self {
        Self {
            next: 0,
            highest_seen: None,
            buffer: ReorderBuffer::new(capacity),
            skipped: BTreeSet::new(),
            last_gap_request: None,
            max_payload,
            threshold,
        }
    }

    /// Demultiplex one transport chunk.
    pub fn ingest(&mut self, chunk: &[u8]) -> Demuxed {
        let mut out = Demuxed::default();
        let mut offset = 0;
        let mut chunk_highest: Option<u32> = None;

        while offset < chunk.len() {
            match Packet::decode_prefix(&chunk[offset..], self.max_payload) {
                Ok((packet, used)) => {
                    offset += used;
                    if let Some(sequence) = self.accept(packet, &mut out) {
                        chunk_highest = Some(chunk_highest.map_or(sequence, |h| h.max(sequence)));
                    }
                },
                Err(error) => {
                    let request = self.buffer.highest_key().map_or(self.next, |k| k.wrapping_add(1));
                    tracing::warn!(%error, offset, request, "dropping malformed chunk tail");
                    out.resend.push(request);
                    out.violation = Some(error);
                    break;
                },
            }
        }

        if out.violation.is_none() {
            if let Some(sequence) = chunk_highest {
                self.highest_seen = Some(self.highest_seen.map_or(sequence, |h| h.max(sequence)));
            }
        }
        out
    }

    /// Buffer or hand back one frame. Returns its sequence unless it was a
    /// duplicate.
    fn accept(&mut self, packet: Packet, out: &mut Demuxed) -> Option<u32> {
        let sequence = packet.header.sequence();
        if sequence < self.next || self.skipped.contains(&sequence) || self.buffer.exists(sequence) {
            tracing::trace!(sequence, "duplicate frame dropped");
            return None;
        }

        if packet.header.class() == Some(PacketClass::Service) {
            self.skipped.insert(sequence);
            out.service.push(packet);
        } else {
            if let Some(evicted) = self.buffer.push(sequence, packet) {
                tracing::debug!(evicted, "inbound buffer full, oldest frame dropped");
            }
            out.inserted.push(sequence);
        }
        Some(sequence)
    }

    /// Pop the next in-order packet, stepping over service sequences.
    pub fn next_ready(&mut self) -> Option<Packet> {
        self.next_ready_before(u32::MAX)
    }

    /// Like [`Inbound::next_ready`] but never yields a sequence at or above
    /// `limit`.
    pub fn next_ready_before(&mut self, limit: u32) -> Option<Packet> {
        while self.next < limit {
            if self.skipped.remove(&self.next) {
                self.next = self.next.wrapping_add(1);
                continue;
            }
            let packet = self.buffer.pop(self.next)?;
            self.next = self.next.wrapping_add(1);
            return Some(packet);
        }
        None
    }

    /// Sequence to request if the stream has stalled behind a gap.
    ///
    /// Fires when the highest sequence seen leads the next expected one by
    /// more than the threshold.
    pub fn gap_request(&mut self) -> Option<u32> {
        let highest = self.highest_seen?;
        if highest < self.next || highest - self.next <= self.threshold {
            return None;
        }
        let due = match self.last_gap_request {
            None => true,
            Some((position, lead_at)) => {
                position != self.next || highest.saturating_sub(lead_at) > self.threshold
            },
        };
        if !due {
            return None;
        }
        self.last_gap_request = Some((self.next, highest));
        tracing::debug!(missing = self.next, highest, "gap detected, requesting resend");
        Some(self.next)
    }

    /// Abandon everything below `sequence` after a resync.
    pub fn resync_to(&mut self, sequence: u32) {
        self.buffer.discard_below(sequence);
        self.skipped = self.skipped.split_off(&sequence);
        self.next = self.next.max(sequence);
        self.last_gap_request = None;
    }

    /// Sequence number expected next.
    pub fn next_expected(&self) -> u32 {
        self.next
    }

    /// Highest sequence number accepted so far.
    pub fn highest_seen(&self) -> Option<u32> {
        self.highest_seen
    }

    /// Packets waiting behind a gap.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop every buffered packet.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.skipped.clear();
    }
}
