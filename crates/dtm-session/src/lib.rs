//! DTM session runtime.
//!
//! Production driver that runs [`dtm_core`]'s Sans-IO engine over TCP with
//! Tokio, the OS RNG and real timers.
//!
//! # Architecture
//!
//! Each connection gets one driver task that owns the [`dtm_core::DtmSession`]
//! and the socket's write half. A reader task splits the inbound stream at
//! packet boundaries; application calls on [`Session`] arrive as queued
//! commands. The driver executes every [`dtm_core::SessionAction`] in order:
//! it honours send delays, writes with back-off, spawns file-transfer tasks
//! and re-opens the connection when the engine asks for a reconnect.
//!
//! # Components
//!
//! - [`Session`]: handle for connect, listen, resume, send and transfer
//! - [`SessionListener`]: accept many responder sessions on one address
//! - [`ChannelObserver`]: turn session events into an `mpsc` stream
//! - [`SystemEnv`]: production environment (OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod driver;
mod error;
mod observer;
mod session;
mod system_env;
mod transfer;
mod transport;

pub use config::{DEFAULT_TRANSFER_ACCEPT_TIMEOUT, DEFAULT_TRANSFER_CHUNK_SIZE, SessionConfig};
pub use error::TransportError;
pub use observer::{ChannelObserver, FixedReply};
pub use session::{Endpoint, Session, SessionListener, SessionStatus};
pub use system_env::SystemEnv;
pub use transport::{INITIAL_WRITE_BACKOFF, MAX_WRITE_ATTEMPTS};
