//! Deterministic simulation harness for DTM protocol testing.
//!
//! Runs two [`dtm_core::DtmSession`]s against each other in memory with a
//! seeded [`SimEnv`], so a failing run replays exactly from its seed (ML-KEM
//! key generation aside). [`LoopbackPair`] can coalesce frames into single
//! reads, drop every Nth message, or rewrite frames in flight.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loopback;
pub mod sim_env;

pub use loopback::{Chaos, Interceptor, LoopbackPair, Node, Policy, Recorder, Side};
pub use sim_env::SimEnv;
