//! Driver configuration.

use std::time::Duration;

use dtm_core::{Capabilities, ChannelConfig, DtmIdentity, DtmParameters, Role, SessionSetup};

/// Default size of one file-transfer read/encrypt/write step.
pub const DEFAULT_TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// Default time a sender waits for the receiver to connect to its ephemeral
/// listener.
pub const DEFAULT_TRANSFER_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to run a session over TCP.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local identity
    pub identity: DtmIdentity,
    /// Requested parameter bundle
    pub parameters: DtmParameters,
    /// Reliability, liveness and handshake timeouts
    pub channel: ChannelConfig,
    /// Optional features
    pub capabilities: Capabilities,
    /// File-transfer chunk size
    pub transfer_chunk_size: usize,
    /// How long an offered file waits for the receiver
    pub transfer_accept_timeout: Duration,
}

impl SessionConfig {
    /// Configuration with defaults for everything but identity and bundle.
    pub fn new(identity: DtmIdentity, parameters: DtmParameters) -> Self {
        Self {
            identity,
            parameters,
            channel: ChannelConfig::default(),
            capabilities: Capabilities::default(),
            transfer_chunk_size: DEFAULT_TRANSFER_CHUNK_SIZE,
            transfer_accept_timeout: DEFAULT_TRANSFER_ACCEPT_TIMEOUT,
        }
    }

    /// Enable the given capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Replace the channel configuration.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub(crate) fn setup(&self, role: Role) -> SessionSetup {
        SessionSetup {
            role,
            identity: self.identity.clone(),
            parameters: self.parameters,
            config: self.channel.clone(),
            capabilities: self.capabilities,
        }
    }
}
