//! Session state machine.
//!
//! Ties the handshake, the channel ciphers and the reliability layer together
//! behind one Sans-IO interface. Every entry point returns the
//! [`SessionAction`]s the driver must execute; events go to the
//! [`SessionObserver`] passed in.
//!
//! # Receive pipeline
//!
//! ```text
//! chunk ─► Inbound::ingest ─► resend requests for framing violations
//!             │
//!             ├─ service packets (arrival order): drain in-order packets
//!             │  below the service sequence, then handle the service packet
//!             │
//!             └─ drain remaining in-order packets ─► gap check ─► Resend
//! ```
//!
//! Draining up to each service packet's own sequence matters for Resync: its
//! keystream position sits between the packets sent before it and those sent
//! after it, so exactly the earlier ones must be decrypted first.
//!
//! # Error propagation
//!
//! Precondition failures of application calls are returned directly. Errors
//! on the receive path are reported as [`SessionEvent::Error`]; fatal ones,
//! and non-fatal ones the application cancels, close the session with a
//! Service/Terminate notice to the peer.

mod forward;
mod transfer;

use std::{collections::VecDeque, mem, time::Duration};

use bytes::Bytes;
use dtm_proto::{MessageFlag, Packet, PacketClass, Phase, ProtocolError, ServiceFlag, TerminateReason};
use zeroize::Zeroizing;

use crate::{
    action::SessionAction,
    channel::{Channel, ChannelKeys, DirectionKey},
    config::{Capabilities, ChannelConfig},
    env::Environment,
    error::SessionError,
    event::{SessionEvent, SessionObserver},
    handshake::{Handshake, Role},
    identity::{DtmIdentity, RemoteIdentity},
    inbound::{Demuxed, Inbound},
    outbound::{Outbound, ResendOutcome},
    params::DtmParameters,
};

/// Everything a session needs besides its environment.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Initiator or responder
    pub role: Role,
    /// Local identity
    pub identity: DtmIdentity,
    /// Requested parameter bundle (the initiator may renegotiate it)
    pub parameters: DtmParameters,
    /// Reliability and liveness tuning
    pub config: ChannelConfig,
    /// Optional features
    pub capabilities: Capabilities,
}

impl SessionSetup {
    /// Setup with default configuration and capabilities.
    pub fn new(role: Role, identity: DtmIdentity, parameters: DtmParameters) -> Self {
        Self {
            role,
            identity,
            parameters,
            config: ChannelConfig::default(),
            capabilities: Capabilities::default(),
        }
    }
}

enum State<E: Environment> {
    Handshake(Box<Handshake<E>>),
    Established(Box<Channel>),
    Closed,
}

/// One DTM connection's protocol state.
pub struct DtmSession<E: Environment> {
    env: E,
    role: Role,
    config: ChannelConfig,
    caps: Capabilities,
    identity: DtmIdentity,
    parameters: DtmParameters,
    remote: RemoteIdentity,
    state: State<E>,
    outbound: Outbound,
    inbound: Inbound,
    actions: Vec<SessionAction>,
    auth_material_cleared: bool,
    missed_pulses: u32,
    pending_request: bool,
    forwarding: forward::Forwarding,
    held: VecDeque<Held>,
    transfers: transfer::Transfers,
    veto_reason: Option<TerminateReason>,
    retained: Option<ChannelKeys>,
}

impl<E: Environment> DtmSession<E> {
    /// A session that will run the full handshake.
    pub fn new(env: E, setup: SessionSetup) -> Self {
        let handshake = Handshake::new(
            env.clone(),
            setup.role,
            setup.identity.clone(),
            setup.parameters,
            setup.capabilities.allow_renegotiation,
        );
        Self::assemble(env, setup, RemoteIdentity::default(), State::Handshake(Box::new(handshake)))
    }

    /// A session that skips the handshake and starts established with keys
    /// from an earlier forwarding exchange or a retained channel.
    pub fn resume(
        env: E,
        setup: SessionSetup,
        keys: ChannelKeys,
        remote: RemoteIdentity,
    ) -> Result<Self, SessionError> {
        let channel = Channel::new(keys)?;
        let mut session =
            Self::assemble(env, setup, remote, State::Established(Box::new(channel)));
        session.auth_material_cleared = true;
        tracing::info!(role = ?session.role, "session resumed without handshake");
        Ok(session)
    }

    fn assemble(env: E, setup: SessionSetup, remote: RemoteIdentity, state: State<E>) -> Self {
        let config = setup.config;
        let outbound = Outbound::new(config.buffer_capacity, config.max_resend);
        let inbound =
            Inbound::new(config.buffer_capacity, config.max_payload, config.resend_threshold);
        Self {
            env,
            role: setup.role,
            config,
            caps: setup.capabilities,
            identity: setup.identity,
            parameters: setup.parameters,
            remote,
            state,
            outbound,
            inbound,
            actions: Vec::new(),
            auth_material_cleared: false,
            missed_pulses: 0,
            pending_request: false,
            forwarding: forward::Forwarding::default(),
            held: VecDeque::new(),
            transfers: transfer::Transfers::default(),
            veto_reason: None,
            retained: None,
        }
    }

    /// Send the opening handshake packet. Does nothing for a responder.
    pub fn start(
        &mut self,
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let State::Handshake(handshake) = &mut self.state else {
            return Ok(Vec::new());
        };
        if let Some(frame) = handshake.start()? {
            self.transmit(
                PacketClass::Exchange,
                frame.phase.to_u16(),
                0,
                frame.payload,
                frame.delay,
                observer,
            )?;
        }
        Ok(self.take_actions())
    }

    /// Feed bytes read from the transport.
    pub fn handle_bytes(
        &mut self,
        chunk: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Vec<SessionAction> {
        if self.is_closed() {
            return Vec::new();
        }
        let demuxed = self.inbound.ingest(chunk);
        if let Err(error) = self.process(demuxed, observer) {
            self.raise(error, observer);
        }
        self.take_actions()
    }

    /// Report an error detected by the driver (transport failure, handshake
    /// timeout).
    pub fn abort(
        &mut self,
        error: SessionError,
        observer: &mut dyn SessionObserver,
    ) -> Vec<SessionAction> {
        if !self.is_closed() {
            self.raise(error, observer);
        }
        self.take_actions()
    }

    /// Encrypt and send application data.
    ///
    /// While a ratchet this side started is waiting for the peer's
    /// confirmation, messages are held and sent under the new keys.
    pub fn send_message(
        &mut self,
        data: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_established("send a message")?;
        let delay = self.parameters.message_delay.sample(&self.env);
        self.send_sealed(
            PacketClass::Message,
            MessageFlag::Transmission.to_u16(),
            0,
            data,
            delay,
            observer,
        )?;
        Ok(self.take_actions())
    }

    /// Send a request outside the retransmit buffer. The next message the
    /// peer sends comes back as [`SessionAction::Response`] instead of a
    /// `DataReceived` event.
    pub fn prepare_request(
        &mut self,
        data: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_established("send a request")?;
        if self.pending_request {
            return Err(SessionError::InvalidState {
                state: "a request is already pending".to_string(),
                operation: "send a request",
            });
        }
        if self.forwarding.holds_sends() {
            return Err(SessionError::InvalidState {
                state: "a ratchet is in progress".to_string(),
                operation: "send a request",
            });
        }
        self.send_sealed(
            PacketClass::Message,
            MessageFlag::Request.to_u16(),
            0,
            data,
            Duration::ZERO,
            observer,
        )?;
        self.pending_request = true;
        Ok(self.take_actions())
    }

    /// Stop waiting for a reply to [`DtmSession::prepare_request`].
    pub fn cancel_request(&mut self) {
        self.pending_request = false;
    }

    /// One keepalive period elapsed.
    pub fn keepalive_tick(&mut self, observer: &mut dyn SessionObserver) -> Vec<SessionAction> {
        if !self.is_established() {
            return Vec::new();
        }
        self.missed_pulses += 1;
        if self.missed_pulses > self.config.connection_timeout {
            let missed = self.missed_pulses;
            if self.caps.auto_reconnect {
                tracing::warn!(missed, "peer silent, reconnecting");
                self.missed_pulses = 0;
                self.actions.push(SessionAction::Reconnect);
            } else {
                self.raise(SessionError::ConnectionTimeout { missed }, observer);
            }
        } else if let Err(error) = self.send_service(ServiceFlag::KeepAlive, 0, observer) {
            self.raise(error, observer);
        }
        self.take_actions()
    }

    /// Ask the peer to realign our inbound keystream, as after a reconnect.
    pub fn request_resync(
        &mut self,
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_established("request a resync")?;
        self.missed_pulses = 0;
        self.send_service(ServiceFlag::DataLost, 0, observer)?;
        Ok(self.take_actions())
    }

    /// Close the session. Idempotent.
    ///
    /// Returns the live channel keys when [`Capabilities::retain_ciphers`] is
    /// set; otherwise they are zeroized.
    pub fn disconnect(
        &mut self,
        reason: TerminateReason,
        observer: &mut dyn SessionObserver,
    ) -> (Vec<SessionAction>, Option<ChannelKeys>) {
        self.shutdown(reason, true, observer);
        (self.take_actions(), self.retained.take())
    }

    /// This side's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Last handshake phase completed, `Established` once live, `None` before
    /// the first phase and after close.
    pub fn phase(&self) -> Option<Phase> {
        match &self.state {
            State::Handshake(handshake) => handshake.phase(),
            State::Established(_) => Some(Phase::Established),
            State::Closed => None,
        }
    }

    /// True while the channel ciphers are live.
    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    /// True once the session has closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Parameter bundle in use, reflecting any renegotiation.
    pub fn parameters(&self) -> DtmParameters {
        match &self.state {
            State::Handshake(handshake) => handshake.parameters(),
            _ => self.parameters,
        }
    }

    /// What is known about the peer.
    pub fn remote_identity(&self) -> &RemoteIdentity {
        match &self.state {
            State::Handshake(handshake) => handshake.remote(),
            _ => &self.remote,
        }
    }

    /// Outbound channel key.
    pub fn transmit_key(&self) -> Option<&DirectionKey> {
        match &self.state {
            State::Established(channel) => Some(&channel.keys().transmit),
            _ => None,
        }
    }

    /// Inbound channel key.
    pub fn receive_key(&self) -> Option<&DirectionKey> {
        match &self.state {
            State::Established(channel) => Some(&channel.keys().receive),
            _ => None,
        }
    }

    /// Keystream bytes consumed as `(sent, received)`.
    pub fn byte_counts(&self) -> Option<(u64, u64)> {
        match &self.state {
            State::Established(channel) => Some((channel.sent_bytes(), channel.received_bytes())),
            _ => None,
        }
    }

    /// Sequence number the next outbound frame will carry.
    pub fn send_sequence(&self) -> u32 {
        self.outbound.next_sequence()
    }

    /// Sequence number expected next from the peer.
    pub fn receive_sequence(&self) -> u32 {
        self.inbound.next_expected()
    }

    /// Resends since the last data-loss warning.
    pub fn resend_count(&self) -> u32 {
        self.outbound.resend_count()
    }

    /// Resends over the session's lifetime.
    pub fn total_resends(&self) -> u64 {
        self.outbound.total_resends()
    }

    /// Consecutive keepalive ticks without a pulse from the peer.
    pub fn missed_pulses(&self) -> u32 {
        self.missed_pulses
    }

    /// True if the auth-phase key material was zeroed before the channel
    /// went live.
    pub fn auth_material_cleared(&self) -> bool {
        self.auth_material_cleared
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Enabled features.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Keys kept back when the session closed on its own with
    /// [`Capabilities::retain_ciphers`] set.
    pub fn take_retained_keys(&mut self) -> Option<ChannelKeys> {
        self.retained.take()
    }

    fn process(
        &mut self,
        demuxed: Demuxed,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        for sequence in demuxed.resend {
            self.send_service(ServiceFlag::Resend, i64::from(sequence), observer)?;
        }
        for packet in demuxed.service {
            self.drain(Some(packet.header.sequence()), observer)?;
            if self.is_closed() {
                return Ok(());
            }
            self.on_packet(packet, observer)?;
        }
        self.drain(None, observer)?;
        if !self.is_closed() {
            if let Some(missing) = self.inbound.gap_request() {
                self.send_service(ServiceFlag::Resend, i64::from(missing), observer)?;
            }
        }
        Ok(())
    }

    fn drain(
        &mut self,
        limit: Option<u32>,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        while !self.is_closed() {
            let next = match limit {
                Some(limit) => self.inbound.next_ready_before(limit),
                None => self.inbound.next_ready(),
            };
            let Some(packet) = next else { break };
            self.on_packet(packet, observer)?;
        }
        Ok(())
    }

    fn on_packet(
        &mut self,
        packet: Packet,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let header = packet.header;
        let (flag, sequence, option) = (header.flag(), header.sequence(), header.option());
        let class =
            header.class().ok_or(ProtocolError::UnknownPacketClass(header.class_byte()))?;

        observer.on_event(&SessionEvent::PacketReceived { class, flag, sequence });
        if is_retained(class, flag) {
            self.send_service(ServiceFlag::Echo, i64::from(sequence), observer)?;
        }

        match class {
            PacketClass::Exchange => self.on_exchange(flag, &packet.payload, observer),
            PacketClass::Message => self.on_message(flag, &packet.payload, observer),
            PacketClass::Service => self.on_service(&packet, observer),
            PacketClass::Transfer => self.on_transfer(flag, option, &packet.payload, observer),
            PacketClass::Forwarding => self.on_forwarding(flag, &packet.payload, observer),
        }
    }

    fn on_exchange(
        &mut self,
        flag: u16,
        payload: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let step = match &mut self.state {
            State::Handshake(handshake) => match handshake.receive(flag, payload, observer) {
                Ok(step) => step,
                Err(error) => {
                    self.veto_reason = handshake.veto_reason();
                    return Err(error);
                },
            },
            _ => return Err(self.unexpected(PacketClass::Exchange, flag)),
        };

        if let Some(frame) = step.reply {
            self.transmit(
                PacketClass::Exchange,
                frame.phase.to_u16(),
                0,
                frame.payload,
                frame.delay,
                observer,
            )?;
        }
        if step.complete {
            self.establish(observer)?;
        }
        Ok(())
    }

    fn establish(&mut self, observer: &mut dyn SessionObserver) -> Result<(), SessionError> {
        let State::Handshake(handshake) = &mut self.state else {
            return Ok(());
        };
        let outcome = handshake.finish()?;
        let channel = Channel::new(outcome.keys)?;
        let transmit = channel.keys().transmit.session;
        let receive = channel.keys().receive.session;

        self.parameters = outcome.parameters;
        self.remote = outcome.remote;
        self.auth_material_cleared = outcome.auth_cleared;
        self.state = State::Established(Box::new(channel));

        tracing::info!(role = ?self.role, parameters = self.parameters.name, "session established");
        observer.on_event(&SessionEvent::Established { transmit, receive });
        Ok(())
    }

    fn on_message(
        &mut self,
        flag: u16,
        payload: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let request = match MessageFlag::from_u16(flag) {
            Some(MessageFlag::Transmission) => false,
            Some(MessageFlag::Request) => true,
            None => return Err(self.unexpected(PacketClass::Message, flag)),
        };
        let data = self.open_sealed(PacketClass::Message, flag, payload)?;

        if self.pending_request && !request {
            self.pending_request = false;
            self.actions.push(SessionAction::Response(data));
            return Ok(());
        }
        observer.on_event(&SessionEvent::DataReceived { data, request });
        Ok(())
    }

    fn on_service(
        &mut self,
        packet: &Packet,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let header = &packet.header;
        let (sequence, option) = (header.sequence(), header.option());
        let Some(flag) = ServiceFlag::from_u16(header.flag()) else {
            tracing::warn!(flag = header.flag(), sequence, "unknown service flag ignored");
            return Ok(());
        };

        match flag {
            ServiceFlag::KeepAlive => self.missed_pulses = 0,
            ServiceFlag::Echo => {
                if let Ok(acknowledged) = u32::try_from(option) {
                    self.outbound.acknowledge(acknowledged);
                }
            },
            ServiceFlag::Resend => {
                if let Ok(requested) = u32::try_from(option) {
                    self.on_resend(requested, observer)?;
                }
            },
            ServiceFlag::DataLost => self.send_resync(observer)?,
            ServiceFlag::Resync => self.on_resync(sequence, option, &packet.payload)?,
            ServiceFlag::Terminate => {
                let reason = TerminateReason::from_i64(option);
                tracing::info!(?reason, "peer terminated the session");
                observer.on_event(&SessionEvent::Terminated { reason });
                self.shutdown(reason, false, observer);
            },
            ServiceFlag::Refusal => {
                self.raise(SessionError::Refused("peer refused the last request".to_string()), observer);
            },
        }
        Ok(())
    }

    fn on_resend(
        &mut self,
        sequence: u32,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        match self.outbound.resend(sequence) {
            ResendOutcome::Replay { bytes, exceeded } => {
                tracing::debug!(sequence, "replaying frame");
                self.actions.push(SessionAction::send(bytes));
                if exceeded {
                    let max = self.config.max_resend;
                    tracing::warn!(max, "resend bound exceeded");
                    self.raise(SessionError::DataLoss(format!("more than {max} resends")), observer);
                }
            },
            ResendOutcome::Filler(bytes) => self.actions.push(SessionAction::send(bytes)),
            ResendOutcome::Missing => {
                tracing::info!(sequence, "requested frame no longer buffered, resynchronizing");
                self.send_resync(observer)?;
            },
            ResendOutcome::Ignored => tracing::debug!(sequence, "resend for unsent sequence ignored"),
        }
        Ok(())
    }

    fn send_resync(&mut self, observer: &mut dyn SessionObserver) -> Result<(), SessionError> {
        if self.forwarding.holds_sends() {
            tracing::debug!("holding resync until the ratchet completes");
            self.held.push_back(Held::Resync);
            return Ok(());
        }
        let State::Established(channel) = &mut self.state else {
            return Err(SessionError::ResyncFailed("no channel to resynchronize".to_string()));
        };
        let sealed = channel.seal(
            &self.env,
            self.identity.secret_id.as_bytes(),
            &self.parameters.message_padding,
        )?;
        let total = channel.sent_bytes();
        self.outbound.clear();
        tracing::info!(total, "sending resync");
        self.transmit(
            PacketClass::Service,
            ServiceFlag::Resync.to_u16(),
            total as i64,
            sealed,
            Duration::ZERO,
            observer,
        )?;
        Ok(())
    }

    fn on_resync(&mut self, sequence: u32, option: i64, payload: &[u8]) -> Result<(), SessionError> {
        let State::Established(channel) = &mut self.state else {
            return Err(SessionError::ResyncFailed(
                "resync before the channel is established".to_string(),
            ));
        };
        let gap = channel.realign(option, payload, &self.remote.secret_id)?;
        self.inbound.resync_to(sequence.wrapping_add(1));
        tracing::info!(gap, sequence, "keystream realigned");
        Ok(())
    }

    fn flush_held(&mut self, observer: &mut dyn SessionObserver) -> Result<(), SessionError> {
        if !self.held.is_empty() {
            tracing::debug!(count = self.held.len(), "flushing sends held for the ratchet");
        }
        while let Some(held) = self.held.pop_front() {
            match held {
                Held::Sealed { class, flag, option, plain, delay } => {
                    self.send_sealed(class, flag, option, plain.as_slice(), delay, observer)?;
                },
                Held::Resync => self.send_resync(observer)?,
            }
        }
        Ok(())
    }

    /// Report an error and close the session if it is fatal or the
    /// application cancels.
    fn raise(&mut self, error: SessionError, observer: &mut dyn SessionObserver) {
        if let SessionError::Vetoed { context } = &error {
            let reason = self.veto_reason.take().unwrap_or(TerminateReason::Vetoed);
            tracing::warn!(context, ?reason, "vetoed by application");
            self.shutdown(reason, true, observer);
            return;
        }

        let severity = error.severity();
        let fatal = error.is_fatal();
        if fatal {
            tracing::error!(%error, ?severity, "session error");
        } else {
            tracing::warn!(%error, ?severity, "session warning");
        }

        let reply = observer.on_event(&SessionEvent::Error { severity, error: error.clone() });
        if fatal || reply.cancel {
            let reason = reply.reason.unwrap_or_else(|| terminate_reason(&error));
            self.shutdown(reason, true, observer);
        }
    }

    fn shutdown(
        &mut self,
        reason: TerminateReason,
        notify_peer: bool,
        observer: &mut dyn SessionObserver,
    ) {
        if self.is_closed() {
            return;
        }
        if notify_peer {
            if let Err(error) = self.send_service(ServiceFlag::Terminate, reason.to_i64(), observer) {
                tracing::debug!(%error, "terminate notice not sent");
            }
        }
        self.actions.push(SessionAction::Close { reason });

        if let State::Established(channel) = mem::replace(&mut self.state, State::Closed) {
            if self.caps.retain_ciphers {
                self.retained = Some(channel.into_keys());
            }
        }
        if self.retained.is_none() {
            self.remote.secret_id.wipe();
        }
        self.outbound.clear();
        self.inbound.clear();
        self.held.clear();
        self.forwarding.reset();
        self.transfers.clear();
        self.pending_request = false;
        tracing::info!(?reason, "session closed");
    }

    fn transmit(
        &mut self,
        class: PacketClass,
        flag: u16,
        option: i64,
        payload: impl Into<Bytes>,
        delay: Duration,
        observer: &mut dyn SessionObserver,
    ) -> Result<u32, SessionError> {
        let (sequence, bytes) =
            self.outbound.frame(class, flag, option, payload, is_retained(class, flag))?;
        tracing::trace!(?class, flag, sequence, "frame queued");
        observer.on_event(&SessionEvent::PacketSent { class, flag, sequence });
        self.actions.push(SessionAction::Send { bytes, delay });
        Ok(sequence)
    }

    fn send_service(
        &mut self,
        flag: ServiceFlag,
        option: i64,
        observer: &mut dyn SessionObserver,
    ) -> Result<u32, SessionError> {
        self.transmit(
            PacketClass::Service,
            flag.to_u16(),
            option,
            Bytes::new(),
            Duration::ZERO,
            observer,
        )
    }

    /// Seal under the transmit key and queue the frame, or hold it while the
    /// peer may already have switched to ratcheted keys.
    fn send_sealed(
        &mut self,
        class: PacketClass,
        flag: u16,
        option: i64,
        plain: &[u8],
        delay: Duration,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        if self.forwarding.holds_sends() {
            tracing::debug!(?class, flag, len = plain.len(), "holding send until the ratchet completes");
            let plain = Zeroizing::new(plain.to_vec());
            self.held.push_back(Held::Sealed { class, flag, option, plain, delay });
            return Ok(());
        }
        let sealed = match &mut self.state {
            State::Established(channel) => {
                channel.seal(&self.env, plain, &self.parameters.message_padding)?
            },
            _ => return Err(self.invalid_state("send on the channel")),
        };
        self.transmit(class, flag, option, sealed, delay, observer)?;
        Ok(())
    }

    fn open_sealed(
        &mut self,
        class: PacketClass,
        flag: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        match &mut self.state {
            State::Established(channel) => channel.open(payload),
            _ => Err(self.unexpected(class, flag)),
        }
    }

    fn ensure_established(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.is_established() { Ok(()) } else { Err(self.invalid_state(operation)) }
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState { state: self.state_name().to_string(), operation }
    }

    fn unexpected(&self, class: PacketClass, flag: u16) -> SessionError {
        SessionError::UnexpectedPacket {
            state: self.state_name().to_string(),
            class: class.to_u8(),
            flag,
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            State::Handshake(_) => "handshaking",
            State::Established(_) => "established",
            State::Closed => "closed",
        }
    }

    fn take_actions(&mut self) -> Vec<SessionAction> {
        mem::take(&mut self.actions)
    }
}

/// A send deferred until a pending ratchet completes.
#[derive(Debug)]
enum Held {
    Sealed { class: PacketClass, flag: u16, option: i64, plain: Zeroizing<Vec<u8>>, delay: Duration },
    Resync,
}

/// Frames kept for retransmission and echoed on receipt.
fn is_retained(class: PacketClass, flag: u16) -> bool {
    match class {
        PacketClass::Service => false,
        PacketClass::Message => flag == MessageFlag::Transmission.to_u16(),
        PacketClass::Exchange | PacketClass::Transfer | PacketClass::Forwarding => true,
    }
}

fn terminate_reason(error: &SessionError) -> TerminateReason {
    match error {
        SessionError::Vetoed { .. } => TerminateReason::Vetoed,
        SessionError::HandshakeTimeout { .. } | SessionError::ConnectionTimeout { .. } => {
            TerminateReason::Timeout
        },
        SessionError::DataLoss(_) => TerminateReason::DataLoss,
        SessionError::ResyncFailed(_) => TerminateReason::ResyncFailed,
        SessionError::Crypto(_) => TerminateReason::CryptoError,
        SessionError::Refused(_) => TerminateReason::ForwardRefused,
        SessionError::InvalidState { .. }
        | SessionError::UnexpectedPacket { .. }
        | SessionError::Protocol(_)
        | SessionError::UnknownParameters { .. }
        | SessionError::ClassificationMismatch { .. } => TerminateReason::ProtocolError,
        SessionError::Transport(_) | SessionError::PeerTerminated(_) => TerminateReason::Normal,
    }
}

#[cfg(test)]
mod tests;
