//! Nine-phase handshake state machine.
//!
//! Both roles run the same phases in the same order. The initiator sends
//! first in every phase and moves on once the responder's packet for that
//! phase is processed; the responder processes first and answers with its own
//! packet for the same phase.
//!
//! ```text
//! Initiator                                   Responder
//!   create(Connect)  ───────────────────────►  process(Connect)
//!   process(Connect) ◄───────────────────────  create(Connect)
//!   create(Init)     ───────────────────────►  process(Init)
//!        ...                                        ...
//!   create(Established) ────────────────────►  process(Established)  [live]
//!   process(Established) ◄──────────────────  create(Established)
//!   [live]
//! ```
//!
//! # Invariants
//!
//! - Phases are consumed in strict order; anything else is an
//!   `UnexpectedPacket` error
//! - Auth-phase key material is zeroed before the channel keys are handed
//!   out, and the auth ciphers are dropped at the same time
//! - Channel keys exist only after `Established` is processed, so a failed
//!   handshake never leaves a live channel behind
//!
//! # Security
//!
//! Every asymmetric key pair is dropped (and so zeroized) as soon as the
//! phase that needs its private half has run.

use std::time::Duration;

use dtm_crypto::{
    AsymmetricCipher, AsymmetricKeyPair, CryptoError, KeyMaterial, PublicKey, SecretBytes,
    StreamCipher,
};
use dtm_proto::{PacketClass, Phase, TerminateReason};
use zeroize::Zeroizing;

use crate::{
    channel::{ChannelKeys, DirectionKey},
    env::Environment,
    error::SessionError,
    event::{SessionEvent, SessionObserver},
    identity::{DtmIdentity, RemoteIdentity},
    params::{DtmParameters, PaddingProfile, ParameterId, ParameterRegistry},
    payloads::{IdentityPayload, from_cbor, to_cbor},
    wrap,
};

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends first in every phase
    Initiator,
    /// Replies to every phase
    Responder,
}

/// A handshake packet ready for framing.
#[derive(Debug)]
pub(crate) struct PhaseFrame {
    pub phase: Phase,
    pub payload: Vec<u8>,
    pub delay: Duration,
}

/// Result of processing one handshake packet.
#[derive(Debug)]
pub(crate) struct Step {
    pub reply: Option<PhaseFrame>,
    pub complete: bool,
}

/// What a finished handshake hands to the channel.
pub(crate) struct HandshakeOutcome {
    pub parameters: DtmParameters,
    pub remote: RemoteIdentity,
    pub keys: ChannelKeys,
    pub auth_cleared: bool,
}

pub(crate) struct Handshake<E: Environment> {
    env: E,
    role: Role,
    identity: DtmIdentity,
    params: DtmParameters,
    allow_renegotiation: bool,
    renegotiated: bool,
    last_sent: Option<Phase>,
    last_received: Option<Phase>,
    veto_reason: Option<TerminateReason>,
    remote: RemoteIdentity,
    peer_params: Option<DtmParameters>,
    auth_pair: Option<AsymmetricKeyPair>,
    peer_auth_key: Option<PublicKey>,
    local_auth: Option<KeyMaterial>,
    peer_auth: Option<KeyMaterial>,
    auth_tx: Option<StreamCipher>,
    auth_rx: Option<StreamCipher>,
    primary_pair: Option<AsymmetricKeyPair>,
    peer_primary_key: Option<PublicKey>,
    local_primary: Option<KeyMaterial>,
    peer_primary: Option<KeyMaterial>,
    keys: Option<ChannelKeys>,
    auth_cleared: bool,
}

impl<E: Environment> Handshake<E> {
    pub(crate) fn new(
        env: E,
        role: Role,
        identity: DtmIdentity,
        params: DtmParameters,
        allow_renegotiation: bool,
    ) -> Self {
        Self {
            env,
            role,
            identity,
            params,
            allow_renegotiation,
            renegotiated: false,
            last_sent: None,
            last_received: None,
            veto_reason: None,
            remote: RemoteIdentity::default(),
            peer_params: None,
            auth_pair: None,
            peer_auth_key: None,
            local_auth: None,
            peer_auth: None,
            auth_tx: None,
            auth_rx: None,
            primary_pair: None,
            peer_primary_key: None,
            local_primary: None,
            peer_primary: None,
            keys: None,
            auth_cleared: false,
        }
    }

    /// Opening packet. Only the initiator has one, and only once.
    pub(crate) fn start(&mut self) -> Result<Option<PhaseFrame>, SessionError> {
        if self.role == Role::Responder || self.last_sent.is_some() {
            return Ok(None);
        }
        self.create(Phase::Connect).map(Some)
    }

    /// Process the peer's packet for one phase and produce our next packet.
    pub(crate) fn receive(
        &mut self,
        flag: u16,
        payload: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<Step, SessionError> {
        let expected = match self.role {
            Role::Initiator => self.last_sent.filter(|sent| self.last_received != Some(*sent)),
            Role::Responder => match self.last_received {
                None => Some(Phase::Connect),
                Some(phase) => phase.next(),
            },
        };
        let phase = Phase::from_u16(flag).filter(|phase| Some(*phase) == expected).ok_or_else(|| {
            SessionError::UnexpectedPacket {
                state: format!("{:?} awaiting {expected:?}", self.role),
                class: PacketClass::Exchange.to_u8(),
                flag,
            }
        })?;

        self.process(phase, payload, observer)?;
        self.last_received = Some(phase);
        tracing::debug!(role = ?self.role, ?phase, "handshake phase processed");

        let reply = match (self.role, phase.next()) {
            (Role::Initiator, Some(next)) => Some(self.create(next)?),
            (Role::Initiator, None) => None,
            (Role::Responder, _) => Some(self.create(phase)?),
        };
        Ok(Step { reply, complete: phase == Phase::Established })
    }

    /// Hand the final keys over once `Established` has been processed.
    pub(crate) fn finish(&mut self) -> Result<HandshakeOutcome, SessionError> {
        let keys = self.keys.take().ok_or_else(|| self.missing("channel keys"))?;
        Ok(HandshakeOutcome {
            parameters: self.params,
            remote: std::mem::take(&mut self.remote),
            keys,
            auth_cleared: self.auth_cleared,
        })
    }

    /// Last phase processed.
    pub(crate) fn phase(&self) -> Option<Phase> {
        self.last_received
    }

    pub(crate) fn parameters(&self) -> DtmParameters {
        self.params
    }

    pub(crate) fn remote(&self) -> &RemoteIdentity {
        &self.remote
    }

    /// Reason the application gave when it vetoed.
    pub(crate) fn veto_reason(&self) -> Option<TerminateReason> {
        self.veto_reason
    }

    fn create(&mut self, phase: Phase) -> Result<PhaseFrame, SessionError> {
        let (payload, delay) = match phase {
            Phase::Connect => {
                let payload = IdentityPayload {
                    public_id: self.identity.public_id.clone(),
                    secret_id: SecretBytes::default(),
                    parameter_id: ParameterId::classification_only(self.params.classification).0,
                    session: None,
                };
                (to_cbor(&payload)?, Duration::ZERO)
            },
            Phase::Init => {
                let payload = IdentityPayload {
                    public_id: self.identity.public_id.clone(),
                    secret_id: SecretBytes::default(),
                    parameter_id: self.params.id().0,
                    session: Some(self.params.auth_session),
                };
                (to_cbor(&payload)?, Duration::ZERO)
            },
            Phase::PreAuth => {
                let pair = self.params.auth_asymmetric.generate_key_pair()?;
                let payload = to_cbor(&pair.public)?;
                self.auth_pair = Some(pair);
                (payload, Duration::ZERO)
            },
            Phase::AuthEx => {
                let peer_key = self.peer_auth_key.as_ref().ok_or_else(|| self.missing("peer auth key"))?;
                let material =
                    KeyMaterial::generate(&self.params.auth_session, |b| self.env.random_bytes(b));
                let plain = Zeroizing::new(to_cbor(&material)?);
                let payload = peer_key.algorithm.encrypt(peer_key, &plain)?;
                self.auth_tx = Some(StreamCipher::new(&self.params.auth_session, &material)?);
                self.local_auth = Some(material);
                (payload, Duration::ZERO)
            },
            Phase::Auth => {
                let payload = IdentityPayload {
                    public_id: self.identity.public_id.clone(),
                    secret_id: self.identity.secret_id.clone(),
                    parameter_id: self.params.id().0,
                    session: Some(self.params.auth_session),
                };
                let plain = Zeroizing::new(to_cbor(&payload)?);
                let sealed = self.seal(&plain, self.params.message_padding)?;
                (sealed, self.params.message_delay.sample(&self.env))
            },
            Phase::Sync => {
                let payload = IdentityPayload {
                    public_id: self.identity.public_id.clone(),
                    secret_id: SecretBytes::default(),
                    parameter_id: self.params.id().0,
                    session: Some(self.params.primary_session),
                };
                let sealed = self.seal(&to_cbor(&payload)?, self.params.message_padding)?;
                (sealed, self.params.message_delay.sample(&self.env))
            },
            Phase::PrimeEx => {
                let pair = self.params.primary_asymmetric.generate_key_pair()?;
                let sealed = self.seal(&to_cbor(&pair.public)?, self.params.primary_key_padding)?;
                self.primary_pair = Some(pair);
                (sealed, self.params.primary_key_delay.sample(&self.env))
            },
            Phase::Primary => {
                let peer_key =
                    self.peer_primary_key.as_ref().ok_or_else(|| self.missing("peer primary key"))?;
                let material =
                    KeyMaterial::generate(&self.params.primary_session, |b| self.env.random_bytes(b));
                let plain = Zeroizing::new(to_cbor(&material)?);
                let encrypted = peer_key.algorithm.encrypt(peer_key, &plain)?;
                let sealed = self.seal(&encrypted, self.params.exchange_padding)?;
                self.local_primary = Some(material);
                if let Some(auth) = self.local_auth.as_mut() {
                    auth.wipe();
                }
                (sealed, self.params.exchange_delay.sample(&self.env))
            },
            Phase::Established => (Vec::new(), Duration::ZERO),
        };

        self.last_sent = Some(phase);
        Ok(PhaseFrame { phase, payload, delay })
    }

    fn process(
        &mut self,
        phase: Phase,
        payload: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        match phase {
            Phase::Connect => {
                let identity: IdentityPayload = from_cbor(payload)?;
                self.remote.public_id = identity.public_id;
                self.notify(phase, observer)?;
                self.negotiate(ParameterId(identity.parameter_id))
            },
            Phase::Init => {
                let identity: IdentityPayload = from_cbor(payload)?;
                let id = ParameterId(identity.parameter_id);
                let peer = ParameterRegistry::by_id(&id)
                    .ok_or(SessionError::UnknownParameters { id })?;
                if peer.classification != self.params.classification {
                    return Err(SessionError::ClassificationMismatch {
                        local: self.params.classification,
                        remote: Some(peer.classification),
                    });
                }
                if identity.session != Some(peer.auth_session) {
                    return Err(encoding("auth session does not match the announced parameters"));
                }
                if identity.public_id != self.remote.public_id {
                    return Err(encoding("public id changed after connect"));
                }
                self.remote.parameter_id = Some(id);
                self.remote.auth_session = Some(peer.auth_session);
                self.peer_params = Some(peer);
                self.notify(phase, observer)
            },
            Phase::PreAuth => {
                let key: PublicKey = from_cbor(payload)?;
                let expected = self.peer_params()?.auth_asymmetric;
                if key.algorithm != expected {
                    return Err(CryptoError::InvalidPublicKey { algorithm: expected.name() }.into());
                }
                self.peer_auth_key = Some(key);
                Ok(())
            },
            Phase::AuthEx => {
                let pair = self.auth_pair.take().ok_or_else(|| self.missing("auth key pair"))?;
                let plain = pair.algorithm().decrypt(&pair, payload)?;
                let material: KeyMaterial = from_cbor(plain.as_bytes())?;
                let session =
                    self.remote.auth_session.ok_or_else(|| self.missing("peer auth session"))?;
                material.check(&session)?;
                self.auth_rx = Some(StreamCipher::new(&session, &material)?);
                self.peer_auth = Some(material);
                Ok(())
            },
            Phase::Auth => {
                let plain = Zeroizing::new(self.open(payload)?);
                let identity: IdentityPayload = from_cbor(&plain)?;
                if identity.public_id != self.remote.public_id {
                    return Err(CryptoError::DecryptionFailed {
                        reason: "authenticated identity does not match".to_string(),
                    }
                    .into());
                }
                self.remote.secret_id = identity.secret_id;
                self.notify(phase, observer)
            },
            Phase::Sync => {
                let identity: IdentityPayload = from_cbor(&self.open(payload)?)?;
                let expected = self.peer_params()?.primary_session;
                if identity.session != Some(expected) {
                    return Err(encoding("primary session does not match the announced parameters"));
                }
                self.remote.primary_session = Some(expected);
                self.notify(phase, observer)
            },
            Phase::PrimeEx => {
                let key: PublicKey = from_cbor(&self.open(payload)?)?;
                let expected = self.peer_params()?.primary_asymmetric;
                if key.algorithm != expected {
                    return Err(CryptoError::InvalidPublicKey { algorithm: expected.name() }.into());
                }
                self.peer_primary_key = Some(key);
                Ok(())
            },
            Phase::Primary => {
                let encrypted = self.open(payload)?;
                let pair = self.primary_pair.take().ok_or_else(|| self.missing("primary key pair"))?;
                let plain = pair.algorithm().decrypt(&pair, &encrypted)?;
                let material: KeyMaterial = from_cbor(plain.as_bytes())?;
                let session =
                    self.remote.primary_session.ok_or_else(|| self.missing("peer primary session"))?;
                material.check(&session)?;
                self.peer_primary = Some(material);
                if let Some(auth) = self.peer_auth.as_mut() {
                    auth.wipe();
                }
                Ok(())
            },
            Phase::Established => self.complete(),
        }
    }

    fn negotiate(&mut self, announced: ParameterId) -> Result<(), SessionError> {
        let local = self.params.classification;
        let Some(remote) = announced.classification() else {
            return Err(SessionError::ClassificationMismatch { local, remote: None });
        };
        if remote == local || self.role == Role::Responder {
            return Ok(());
        }
        if !self.allow_renegotiation {
            tracing::warn!(?local, ?remote, "classification differs and renegotiation is disabled");
            return Err(SessionError::Vetoed { context: "classification renegotiation" });
        }
        if self.renegotiated {
            return Err(SessionError::ClassificationMismatch { local, remote: Some(remote) });
        }
        let adopted = ParameterRegistry::for_classification(remote)
            .ok_or(SessionError::ClassificationMismatch { local, remote: Some(remote) })?;
        tracing::info!(from = self.params.name, to = adopted.name, "adopting peer classification");
        self.params = adopted;
        self.renegotiated = true;
        Ok(())
    }

    fn complete(&mut self) -> Result<(), SessionError> {
        let local = self.local_primary.take().ok_or_else(|| self.missing("local primary key"))?;
        let peer = self.peer_primary.take().ok_or_else(|| self.missing("peer primary key"))?;
        let receive_session =
            self.remote.primary_session.ok_or_else(|| self.missing("peer primary session"))?;

        self.auth_tx = None;
        self.auth_rx = None;
        self.auth_cleared = self.local_auth.as_ref().is_some_and(KeyMaterial::is_zeroed)
            && self.peer_auth.as_ref().is_some_and(KeyMaterial::is_zeroed);
        self.local_auth = None;
        self.peer_auth = None;

        self.keys = Some(ChannelKeys {
            transmit: DirectionKey { session: self.params.primary_session, material: local },
            receive: DirectionKey { session: receive_session, material: peer },
        });
        Ok(())
    }

    fn notify(&mut self, phase: Phase, observer: &mut dyn SessionObserver) -> Result<(), SessionError> {
        let reply = observer
            .on_event(&SessionEvent::IdentityReceived { phase, identity: self.remote.clone() });
        if reply.cancel {
            self.veto_reason = reply.reason;
            return Err(SessionError::Vetoed { context: phase_label(phase) });
        }
        Ok(())
    }

    fn seal(&mut self, plain: &[u8], padding: PaddingProfile) -> Result<Vec<u8>, SessionError> {
        let mut wrapped = wrap::wrap(&self.env, plain, &padding);
        let cipher = self.auth_tx.as_mut().ok_or(SessionError::InvalidState {
            state: "no auth cipher".to_string(),
            operation: "seal a handshake payload",
        })?;
        cipher.transform_in_place(&mut wrapped)?;
        Ok(wrapped)
    }

    fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let cipher = self.auth_rx.as_mut().ok_or(SessionError::InvalidState {
            state: "no auth cipher".to_string(),
            operation: "open a handshake payload",
        })?;
        let mut buf = Zeroizing::new(sealed.to_vec());
        cipher.transform_in_place(&mut buf)?;
        wrap::unwrap(&buf)
    }

    fn peer_params(&self) -> Result<DtmParameters, SessionError> {
        self.peer_params.ok_or_else(|| self.missing("peer parameters"))
    }

    fn missing(&self, what: &str) -> SessionError {
        SessionError::UnexpectedPacket {
            state: format!("{:?} after {:?} without {what}", self.role, self.last_received),
            class: PacketClass::Exchange.to_u8(),
            flag: 0,
        }
    }
}

fn encoding(reason: &str) -> SessionError {
    SessionError::Protocol(dtm_proto::ProtocolError::Encoding(reason.to_string()))
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Connect => "connect",
        Phase::Init => "init",
        Phase::PreAuth => "pre-auth",
        Phase::AuthEx => "auth exchange",
        Phase::Auth => "auth",
        Phase::Sync => "sync",
        Phase::PrimeEx => "primary key exchange",
        Phase::Primary => "primary",
        Phase::Established => "established",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::test_env::TestEnv, event::EventReply, params::SecurityClassification};

    fn params(name: &str) -> DtmParameters {
        ParameterRegistry::by_name(name).unwrap_or_else(|| panic!("{name}"))
    }

    fn pair(initiator: &str, responder: &str) -> (Handshake<TestEnv>, Handshake<TestEnv>) {
        (
            Handshake::new(
                TestEnv::seeded(1),
                Role::Initiator,
                DtmIdentity::new("alice", "alice-secret"),
                params(initiator),
                true,
            ),
            Handshake::new(
                TestEnv::seeded(2),
                Role::Responder,
                DtmIdentity::new("bob", "bob-secret"),
                params(responder),
                true,
            ),
        )
    }

    fn proceed(_: &SessionEvent) -> EventReply {
        EventReply::proceed()
    }

    /// Drive both sides to completion, returning every phase the initiator sent.
    fn run(
        initiator: &mut Handshake<TestEnv>,
        responder: &mut Handshake<TestEnv>,
    ) -> Result<Vec<Phase>, SessionError> {
        let mut sent = Vec::new();
        let mut frame = initiator.start()?;
        while let Some(outgoing) = frame.take() {
            sent.push(outgoing.phase);
            let step = responder.receive(outgoing.phase.to_u16(), &outgoing.payload, &mut proceed)?;
            let Some(reply) = step.reply else { break };
            let step = initiator.receive(reply.phase.to_u16(), &reply.payload, &mut proceed)?;
            frame = step.reply;
        }
        Ok(sent)
    }

    #[test]
    fn full_handshake_cross_matches_keys() {
        let (mut initiator, mut responder) = pair("X3.1", "X3.1");
        let sent = run(&mut initiator, &mut responder).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(sent, Phase::ALL);

        let a = initiator.finish().unwrap_or_else(|e| panic!("{e}"));
        let b = responder.finish().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.keys.transmit, b.keys.receive);
        assert_eq!(a.keys.receive, b.keys.transmit);
        assert!(a.auth_cleared && b.auth_cleared);
        assert_eq!(a.remote.secret_id, SecretBytes::from_slice(b"bob-secret"));
        assert_eq!(b.remote.secret_id, SecretBytes::from_slice(b"alice-secret"));
    }

    #[test]
    fn bundles_may_differ_within_a_classification() {
        let (mut initiator, mut responder) = pair("X4.2", "X4.1");
        run(&mut initiator, &mut responder).unwrap_or_else(|e| panic!("{e}"));
        let a = initiator.finish().unwrap_or_else(|e| panic!("{e}"));
        let b = responder.finish().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.parameters.name, "X4.2");
        assert_eq!(a.keys.transmit.session, params("X4.2").primary_session);
        assert_eq!(a.keys.receive.session, params("X4.1").primary_session);
        assert_eq!(a.keys.transmit, b.keys.receive);
    }

    #[test]
    fn initiator_adopts_responder_classification() {
        let (mut initiator, mut responder) = pair("X4.1", "X1.1");
        let Some(connect) = initiator.start().unwrap_or_else(|e| panic!("{e}")) else {
            unreachable!("initiator opens the handshake");
        };
        let step = responder
            .receive(connect.phase.to_u16(), &connect.payload, &mut proceed)
            .unwrap_or_else(|e| panic!("{e}"));
        let Some(reply) = step.reply else { unreachable!("responder answers connect") };
        initiator
            .receive(reply.phase.to_u16(), &reply.payload, &mut proceed)
            .unwrap_or_else(|e| panic!("{e}"));

        let expected = ParameterRegistry::for_classification(SecurityClassification::X1)
            .map(|p| p.id());
        assert_eq!(Some(initiator.parameters().id()), expected);
        assert_eq!(responder.parameters().name, "X1.1");
    }

    #[test]
    fn renegotiation_can_be_disabled() {
        let (_, mut responder) = pair("X4.1", "X1.1");
        let mut initiator = Handshake::new(
            TestEnv::seeded(3),
            Role::Initiator,
            DtmIdentity::new("alice", "s"),
            params("X4.1"),
            false,
        );
        let result = run(&mut initiator, &mut responder);
        assert_eq!(result, Err(SessionError::Vetoed { context: "classification renegotiation" }));
    }

    #[test]
    fn phases_cannot_be_skipped() {
        let (_, mut responder) = pair("X3.1", "X3.1");
        let result = responder.receive(Phase::Init.to_u16(), &[], &mut proceed);
        assert!(matches!(result, Err(SessionError::UnexpectedPacket { .. })));
        assert_eq!(responder.phase(), None);
    }

    #[test]
    fn identity_veto_carries_the_reason() {
        let (mut initiator, mut responder) = pair("X3.1", "X3.1");
        let Some(connect) = initiator.start().unwrap_or_else(|e| panic!("{e}")) else {
            unreachable!("initiator opens the handshake");
        };
        let mut veto = |_: &SessionEvent| EventReply::cancel_with(TerminateReason::Normal);
        let result = responder.receive(connect.phase.to_u16(), &connect.payload, &mut veto);
        assert_eq!(result.err(), Some(SessionError::Vetoed { context: "connect" }));
        assert_eq!(responder.veto_reason(), Some(TerminateReason::Normal));
    }

    #[test]
    fn no_keys_before_established() {
        let (mut initiator, _) = pair("X3.1", "X3.1");
        assert!(initiator.finish().is_err());
    }
}
