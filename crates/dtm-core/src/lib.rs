//! Core
//!
//! Action-based state machine for the Deferred Trust Model (DTM) protocol: the
//! nine-phase handshake (Connect through Established), the post-handshake
//! channel, and the reliability layer that keeps both ends' keystreams in
//! step.
//!
//! # Architecture
//!
//! The engine is Sans-IO. A driver feeds it transport bytes and timer ticks
//! and executes the [`SessionAction`]s it returns; the application answers
//! [`SessionEvent`]s through a [`SessionObserver`]. Randomness comes from an
//! [`Environment`], so a seeded implementation replays a session exactly
//! (apart from ML-KEM key generation, which draws from the OS).
//!
//! # Components
//!
//! - [`DtmSession`]: handshake, channel and liveness for one connection
//! - [`Outbound`] / [`Inbound`]: sequencing, retransmission and reordering
//! - [`DtmParameters`]: the eight parameter bundles and their registry
//! - [`wrap`]: random padding applied before encryption
//!
//! # Security
//!
//! - Secret ids, key material and keypairs zeroize on drop.
//! - Auth-phase material is wiped before the channel goes live.
//! - The channel uses an unauthenticated stream cipher. Integrity rests on
//!   the padding markers and on resync comparing identities; an on-path
//!   attacker can still flip bits in message plaintext.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod channel;
pub mod config;
mod env;
mod error;
mod event;
mod handshake;
mod identity;
mod inbound;
mod outbound;
pub mod params;
mod payloads;
mod reorder;
mod session;
pub mod wrap;

pub use action::SessionAction;
pub use channel::{ChannelKeys, DirectionKey};
pub use config::{Capabilities, ChannelConfig};
pub use env::Environment;
pub use error::{SessionError, Severity};
pub use event::{AcceptAll, EventReply, SessionEvent, SessionObserver};
pub use handshake::Role;
pub use identity::{DtmIdentity, RemoteIdentity};
pub use inbound::{Demuxed, Inbound};
pub use outbound::{Outbound, ResendOutcome};
pub use params::{
    DelayRange, DtmParameters, PaddingEngine, PaddingProfile, ParameterId, ParameterRegistry,
    SecurityClassification, SizeRange,
};
pub use payloads::{ForwardRecord, KeyInstruction, TransferRequest};
pub use reorder::ReorderBuffer;
pub use session::{DtmSession, SessionSetup};
