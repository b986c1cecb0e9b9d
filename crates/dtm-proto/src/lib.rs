//! Wire framing for the Deferred Trust Model (DTM) protocol.
//!
//! Every unit on the transport is a fixed 23-byte big-endian [`PacketHeader`]
//! followed by `payload_length` opaque bytes. The framer performs structural
//! validation only; sequencing, retransmission and decryption live in
//! `dtm-core`.
//!
//! The transport is a byte stream, so several packets may arrive in one read.
//! [`complete_prefix`] tells a reader how many buffered bytes form whole
//! packets, and [`Packet::decode`] slices one packet off the front of a buffer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod class;
pub mod errors;
mod header;
mod packet;

pub use class::{
    ForwardingFlag, MessageFlag, PacketClass, Phase, ServiceFlag, TerminateReason,
    TransferFlag,
};
pub use errors::{ProtocolError, Result};
pub use header::PacketHeader;
pub use packet::{Packet, complete_prefix};
