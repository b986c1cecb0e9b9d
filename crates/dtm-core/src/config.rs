//! Channel configuration and capability switches.

use std::time::Duration;

/// Slots in each reorder/retransmit buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Largest declared payload accepted from the wire (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Sequence lead over the next expected packet that triggers a resend request.
pub const DEFAULT_RESEND_THRESHOLD: u32 = 10;

/// Retransmissions tolerated before a data-loss warning.
pub const DEFAULT_MAX_RESEND: u32 = 1024;

/// Missed keepalive ticks before the connection is considered dead.
pub const DEFAULT_CONNECTION_TIMEOUT: u32 = 10;

/// Interval between keepalive ticks.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for each handshake reply.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(240);

/// Reliability and liveness tuning for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Capacity of the inbound and outbound buffers
    pub buffer_capacity: usize,
    /// Maximum accepted payload length
    pub max_payload: u64,
    /// Gap size that triggers a proactive resend request
    pub resend_threshold: u32,
    /// Resends tolerated before a data-loss warning
    pub max_resend: u32,
    /// Missed keepalive ticks tolerated (one tick per `keepalive_interval`)
    pub connection_timeout: u32,
    /// Keepalive tick period
    pub keepalive_interval: Duration,
    /// Per-phase handshake reply timeout
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            resend_threshold: DEFAULT_RESEND_THRESHOLD,
            max_resend: DEFAULT_MAX_RESEND,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Optional features, enabled explicitly rather than inferred from which
/// observers exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Answer key-forwarding requests
    pub key_forwarding: bool,
    /// Offer and accept file transfers
    pub file_transfer: bool,
    /// Reconnect instead of failing on keepalive timeout
    pub auto_reconnect: bool,
    /// Hand live channel keys back on disconnect instead of wiping them
    pub retain_ciphers: bool,
    /// Let the initiator adopt the responder's classification at Connect
    pub allow_renegotiation: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            key_forwarding: false,
            file_transfer: false,
            auto_reconnect: false,
            retain_ciphers: false,
            allow_renegotiation: true,
        }
    }
}

impl Capabilities {
    /// Every optional feature switched on.
    pub fn all() -> Self {
        Self {
            key_forwarding: true,
            file_transfer: true,
            auto_reconnect: true,
            retain_ciphers: true,
            allow_renegotiation: true,
        }
    }
}
