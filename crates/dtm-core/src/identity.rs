//! Local and remote identities.

use dtm_crypto::{SecretBytes, SymmetricSession};
use zeroize::Zeroize;

use crate::params::ParameterId;

/// This side's identity, created by the application before the handshake.
///
/// The public id is exchanged unauthenticated at Connect; the secret id only
/// travels once an auth-phase cipher is live.
#[derive(Clone)]
pub struct DtmIdentity {
    /// Lookup key, exchanged early
    pub public_id: Vec<u8>,
    /// Authenticator, exchanged encrypted
    pub secret_id: SecretBytes,
}

impl DtmIdentity {
    /// A new identity.
    pub fn new(public_id: impl Into<Vec<u8>>, secret_id: impl Into<Vec<u8>>) -> Self {
        Self { public_id: public_id.into(), secret_id: SecretBytes::new(secret_id.into()) }
    }
}

impl Drop for DtmIdentity {
    fn drop(&mut self) {
        self.public_id.zeroize();
    }
}

impl std::fmt::Debug for DtmIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtmIdentity")
            .field("public_id", &String::from_utf8_lossy(&self.public_id))
            .finish_non_exhaustive()
    }
}

/// What this side has learned about the peer so far.
///
/// Fields fill in as the handshake progresses: the public id at Connect, the
/// parameter set and auth session at Init, the secret id at Auth and the
/// primary session at Sync.
#[derive(Clone, Default)]
pub struct RemoteIdentity {
    /// Peer's public id
    pub public_id: Vec<u8>,
    /// Peer's secret id (empty until Auth)
    pub secret_id: SecretBytes,
    /// Peer's parameter-set identifier
    pub parameter_id: Option<ParameterId>,
    /// Peer's auth-phase symmetric session
    pub auth_session: Option<SymmetricSession>,
    /// Peer's primary-phase symmetric session
    pub primary_session: Option<SymmetricSession>,
}

impl Drop for RemoteIdentity {
    fn drop(&mut self) {
        self.public_id.zeroize();
    }
}

impl std::fmt::Debug for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdentity")
            .field("public_id", &String::from_utf8_lossy(&self.public_id))
            .field("has_secret_id", &!self.secret_id.is_empty())
            .field("parameter_id", &self.parameter_id)
            .finish_non_exhaustive()
    }
}
