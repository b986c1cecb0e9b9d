use std::{collections::VecDeque, path::PathBuf};

use bytes::Bytes;
use dtm_proto::{Packet, PacketClass, Phase, ServiceFlag, TerminateReason};

use super::*;
use crate::{
    env::test_env::TestEnv,
    event::EventReply,
    params::ParameterRegistry,
    payloads::KeyInstruction,
};

type Policy = Box<dyn FnMut(&SessionEvent) -> EventReply>;

struct Recorder {
    events: Vec<SessionEvent>,
    policy: Policy,
}

impl Recorder {
    fn proceeding() -> Self {
        Self::with(|_| EventReply::proceed())
    }

    fn with(policy: impl FnMut(&SessionEvent) -> EventReply + 'static) -> Self {
        Self { events: Vec::new(), policy: Box::new(policy) }
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::DataReceived { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<SessionError> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    fn saw(&self, predicate: impl Fn(&SessionEvent) -> bool) -> bool {
        self.events.iter().any(predicate)
    }
}

impl SessionObserver for Recorder {
    fn on_event(&mut self, event: &SessionEvent) -> EventReply {
        let reply = (self.policy)(event);
        self.events.push(event.clone());
        reply
    }
}

struct Peer {
    session: DtmSession<TestEnv>,
    observer: Recorder,
    wire: VecDeque<Bytes>,
    other: Vec<SessionAction>,
}

impl Peer {
    fn new(seed: u64, setup: SessionSetup) -> Self {
        Self::from_session(DtmSession::new(TestEnv::seeded(seed), setup))
    }

    fn from_session(session: DtmSession<TestEnv>) -> Self {
        Self { session, observer: Recorder::proceeding(), wire: VecDeque::new(), other: Vec::new() }
    }

    fn absorb(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Send { bytes, .. } => self.wire.push_back(bytes),
                other => self.other.push(other),
            }
        }
    }

    fn send(&mut self, data: &[u8]) {
        let actions = self.session.send_message(data, &mut self.observer).unwrap();
        self.absorb(actions);
    }
}

struct Pair {
    a: Peer,
    b: Peer,
}

fn setup(role: Role, public: &str, caps: Capabilities, config: ChannelConfig) -> SessionSetup {
    SessionSetup {
        role,
        identity: DtmIdentity::new(public, format!("{public}-secret")),
        parameters: ParameterRegistry::by_name("X3.1").unwrap(),
        config,
        capabilities: caps,
    }
}

impl Pair {
    fn new(caps_a: Capabilities, caps_b: Capabilities, config: ChannelConfig) -> Self {
        Self {
            a: Peer::new(1, setup(Role::Initiator, "alice", caps_a, config.clone())),
            b: Peer::new(2, setup(Role::Responder, "bob", caps_b, config)),
        }
    }

    fn connected(caps_a: Capabilities, caps_b: Capabilities, config: ChannelConfig) -> Self {
        let mut pair = Self::new(caps_a, caps_b, config);
        let actions = pair.a.session.start(&mut pair.a.observer).unwrap();
        pair.a.absorb(actions);
        pair.pump();
        assert!(pair.a.session.is_established() && pair.b.session.is_established());
        pair
    }

    fn default_connected() -> Self {
        Self::connected(Capabilities::default(), Capabilities::default(), ChannelConfig::default())
    }

    /// Deliver one frame from `a` to `b` (or the reverse). False if none queued.
    fn deliver_one(&mut self, a_to_b: bool) -> bool {
        let (from, to) = if a_to_b { (&mut self.a, &mut self.b) } else { (&mut self.b, &mut self.a) };
        let Some(bytes) = from.wire.pop_front() else { return false };
        let actions = to.session.handle_bytes(&bytes, &mut to.observer);
        to.absorb(actions);
        true
    }

    fn pump(&mut self) {
        self.pump_dropping(|_, _| false);
    }

    /// Deliver frames until both wires are empty, discarding those `discard`
    /// selects. `discard` gets the direction (true for a to b) and the packet.
    fn pump_dropping(&mut self, mut discard: impl FnMut(bool, &Packet) -> bool) {
        loop {
            let a_to_b = if !self.a.wire.is_empty() {
                true
            } else if !self.b.wire.is_empty() {
                false
            } else {
                break;
            };
            let wire = if a_to_b { &mut self.a.wire } else { &mut self.b.wire };
            let Some(front) = wire.front() else { break };
            let packet = Packet::decode(front).unwrap();
            if discard(a_to_b, &packet) {
                wire.pop_front();
                continue;
            }
            self.deliver_one(a_to_b);
        }
    }
}

#[test]
fn handshake_establishes_mirrored_channel() {
    let pair = Pair::default_connected();
    let (a, b) = (&pair.a.session, &pair.b.session);

    assert_eq!(a.phase(), Some(Phase::Established));
    assert_eq!(a.transmit_key(), b.receive_key());
    assert_eq!(a.receive_key(), b.transmit_key());
    assert!(a.auth_material_cleared() && b.auth_material_cleared());
    assert_eq!(a.remote_identity().public_id, b"bob".to_vec());
    assert_eq!(b.remote_identity().public_id, b"alice".to_vec());
    assert!(pair.a.observer.saw(|e| matches!(e, SessionEvent::Established { .. })));
    assert!(pair.a.observer.errors().is_empty() && pair.b.observer.errors().is_empty());
}

#[test]
fn messages_flow_both_ways() {
    let mut pair = Pair::default_connected();
    pair.a.send(b"hello bob");
    pair.b.send(b"hello alice");
    pair.a.send(b"");
    pair.pump();

    assert_eq!(pair.b.observer.received(), vec![b"hello bob".to_vec(), Vec::new()]);
    assert_eq!(pair.a.observer.received(), vec![b"hello alice".to_vec()]);

    let (sent, _) = pair.a.session.byte_counts().unwrap();
    let (_, received) = pair.b.session.byte_counts().unwrap();
    assert_eq!(sent, received);
}

#[test]
fn responder_veto_reaches_the_initiator() {
    let mut pair =
        Pair::new(Capabilities::default(), Capabilities::default(), ChannelConfig::default());
    pair.b.observer = Recorder::with(|event| match event {
        SessionEvent::IdentityReceived { .. } => EventReply::cancel_with(TerminateReason::Normal),
        _ => EventReply::proceed(),
    });
    let actions = pair.a.session.start(&mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    pair.pump();

    assert!(pair.b.session.is_closed());
    assert!(pair.a.session.is_closed());
    assert!(pair.a.observer.saw(|e| matches!(
        e,
        SessionEvent::Terminated { reason: TerminateReason::Normal }
    )));
    assert!(pair.a.other.contains(&SessionAction::Close { reason: TerminateReason::Normal }));
}

#[test]
fn gap_triggers_resend_and_recovers_order() {
    let config = ChannelConfig { resend_threshold: 2, ..ChannelConfig::default() };
    let mut pair = Pair::connected(Capabilities::default(), Capabilities::default(), config);
    for i in 0..5u8 {
        pair.a.send(&[b'm', b'0' + i]);
    }

    let mut dropped = false;
    pair.pump_dropping(|a_to_b, packet| {
        let hit = a_to_b && !dropped && packet.header.class() == Some(PacketClass::Message);
        dropped |= hit;
        hit
    });

    let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![b'm', b'0' + i]).collect();
    assert_eq!(pair.b.observer.received(), expected);
    assert_eq!(pair.a.session.total_resends(), 1);
    assert!(pair.b.observer.errors().is_empty());
}

#[test]
fn evicted_frame_is_replaced_by_resync() {
    let config = ChannelConfig { buffer_capacity: 2, resend_threshold: 1, ..ChannelConfig::default() };
    let mut pair = Pair::connected(Capabilities::default(), Capabilities::default(), config);
    for data in [&b"lost"[..], b"one", b"two", b"three"] {
        pair.a.send(data);
    }

    let mut dropped = false;
    pair.pump_dropping(|a_to_b, packet| {
        let hit = a_to_b && !dropped && packet.header.class() == Some(PacketClass::Message);
        dropped |= hit;
        hit
    });
    pair.a.send(b"after");
    pair.pump();

    assert_eq!(pair.b.observer.received(), vec![b"after".to_vec()]);
    assert!(pair.a.observer.errors().is_empty() && pair.b.observer.errors().is_empty());
    assert!(pair.b.session.is_established());
    let (sent, _) = pair.a.session.byte_counts().unwrap();
    let (_, received) = pair.b.session.byte_counts().unwrap();
    assert_eq!(sent, received);
}

#[test]
fn data_lost_request_realigns_the_peer() {
    let mut pair = Pair::default_connected();
    pair.a.send(b"vanishes");
    pair.a.wire.clear();

    let actions = pair.b.session.request_resync(&mut pair.b.observer).unwrap();
    pair.b.absorb(actions);
    pair.pump();
    pair.a.send(b"visible");
    pair.pump();

    assert_eq!(pair.b.observer.received(), vec![b"visible".to_vec()]);
    assert!(pair.b.observer.errors().is_empty());
}

#[test]
fn silent_peer_times_out() {
    let config = ChannelConfig { connection_timeout: 2, ..ChannelConfig::default() };
    let mut pair = Pair::connected(Capabilities::default(), Capabilities::default(), config);

    for _ in 0..2 {
        let actions = pair.a.session.keepalive_tick(&mut pair.a.observer);
        assert!(matches!(actions.as_slice(), [SessionAction::Send { .. }]));
    }
    let actions = pair.a.session.keepalive_tick(&mut pair.a.observer);

    assert!(actions.contains(&SessionAction::Close { reason: TerminateReason::Timeout }));
    assert!(pair.a.session.is_closed());
    assert_eq!(pair.a.observer.errors(), vec![SessionError::ConnectionTimeout { missed: 3 }]);
}

#[test]
fn silent_peer_triggers_reconnect_when_enabled() {
    let config = ChannelConfig { connection_timeout: 1, ..ChannelConfig::default() };
    let caps = Capabilities { auto_reconnect: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, Capabilities::default(), config);

    pair.a.session.keepalive_tick(&mut pair.a.observer);
    let actions = pair.a.session.keepalive_tick(&mut pair.a.observer);

    assert_eq!(actions, vec![SessionAction::Reconnect]);
    assert!(pair.a.session.is_established());
    assert_eq!(pair.a.session.missed_pulses(), 0);
}

#[test]
fn keepalive_resets_missed_pulses() {
    let mut pair = Pair::default_connected();
    let actions = pair.b.session.keepalive_tick(&mut pair.b.observer);
    pair.b.absorb(actions);
    let actions = pair.a.session.keepalive_tick(&mut pair.a.observer);
    pair.a.absorb(actions);
    assert_eq!(pair.a.session.missed_pulses(), 1);

    pair.pump();
    assert_eq!(pair.a.session.missed_pulses(), 0);
}

#[test]
fn request_reply_bypasses_data_events() {
    let mut pair = Pair::default_connected();
    let actions = pair.a.session.prepare_request(b"ping", &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    assert!(matches!(
        pair.a.session.prepare_request(b"again", &mut pair.a.observer),
        Err(SessionError::InvalidState { .. })
    ));
    pair.pump();

    assert!(pair.b.observer.saw(|e| matches!(
        e,
        SessionEvent::DataReceived { data, request: true } if data == b"ping"
    )));
    pair.b.send(b"pong");
    pair.pump();

    assert_eq!(pair.a.other, vec![SessionAction::Response(b"pong".to_vec())]);
    assert!(pair.a.observer.received().is_empty());
}

#[test]
fn ratchet_replaces_channel_keys() {
    let caps = Capabilities { key_forwarding: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, caps, ChannelConfig::default());
    let before = pair.a.session.transmit_key().cloned();

    let actions = pair.a.session.request_key(KeyInstruction::Ratchet, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    // KeyRequest to bob, KeyResponse back; alice now holds sends.
    while pair.deliver_one(true) {}
    while pair.deliver_one(false) {}
    pair.a.send(b"held");
    assert!(pair.a.wire.iter().all(|bytes| {
        Packet::decode(bytes).unwrap().header.class() != Some(PacketClass::Message)
    }));

    pair.pump();
    assert_ne!(pair.a.session.transmit_key().cloned(), before);
    assert_eq!(pair.a.session.transmit_key(), pair.b.session.receive_key());
    assert_eq!(pair.a.session.receive_key(), pair.b.session.transmit_key());
    assert_eq!(pair.b.observer.received(), vec![b"held".to_vec()]);

    pair.b.send(b"fresh keys");
    pair.pump();
    assert_eq!(pair.a.observer.received(), vec![b"fresh keys".to_vec()]);
    assert!(pair.b.observer.saw(|e| matches!(e, SessionEvent::KeyRequested { .. })));
    assert!(pair.a.observer.saw(|e| matches!(e, SessionEvent::KeySynchronized { .. })));
}

fn ratchet_caps() -> Capabilities {
    Capabilities { key_forwarding: true, file_transfer: true, ..Capabilities::default() }
}

impl Pair {
    /// Start a ratchet on `a` and run it until `a` has queued KeyReturn and
    /// waits for KeySynchronized. Bob has not seen KeyReturn yet.
    fn await_ratchet_confirmation(&mut self) {
        let actions = self.a.session.request_key(KeyInstruction::Ratchet, &mut self.a.observer).unwrap();
        self.a.absorb(actions);
        while self.deliver_one(true) {}
        while self.deliver_one(false) {}
    }
}

/// Classes of the queued frames that carry channel ciphertext.
fn sealed_on_wire(peer: &Peer) -> Vec<PacketClass> {
    peer.wire
        .iter()
        .filter_map(|bytes| {
            let header = Packet::decode(bytes).unwrap().header;
            let class = header.class().unwrap();
            let sealed = class != PacketClass::Service || header.flag() == ServiceFlag::Resync.to_u16();
            sealed.then_some(class)
        })
        .collect()
}

#[test]
fn sends_during_a_ratchet_wait_for_the_new_keys() {
    let mut pair = Pair::connected(ratchet_caps(), ratchet_caps(), ChannelConfig::default());
    pair.await_ratchet_confirmation();

    let (request, actions) =
        pair.a.session.offer_file("held.bin", 64, 40_002, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    pair.a.send(b"held message");
    // Bob loses track before reading KeyReturn, so alice owes a Resync too.
    let actions = pair.b.session.request_resync(&mut pair.b.observer).unwrap();
    pair.b.absorb(actions);
    while pair.deliver_one(false) {}
    assert_eq!(sealed_on_wire(&pair.a), vec![PacketClass::Forwarding]);

    pair.pump();
    assert!(pair.a.observer.errors().is_empty(), "{:?}", pair.a.observer.errors());
    assert!(pair.b.observer.errors().is_empty(), "{:?}", pair.b.observer.errors());
    assert!(pair.a.session.is_established() && pair.b.session.is_established());
    assert_eq!(pair.a.session.transmit_key(), pair.b.session.receive_key());

    assert_eq!(pair.b.observer.received(), vec![b"held message".to_vec()]);
    assert!(pair.b.observer.saw(|e| matches!(e, SessionEvent::FileRequest { .. })));
    assert!(pair.a.observer.saw(|e| matches!(e, SessionEvent::FileRefused { id } if *id == request.id)));
    assert_eq!(pair.a.other, vec![SessionAction::AbortTransfer { id: request.id }]);

    pair.b.send(b"after the resync");
    pair.pump();
    assert_eq!(pair.a.observer.received(), vec![b"after the resync".to_vec()]);
}

#[test]
fn transfer_receipt_during_a_ratchet_reaches_the_sender() {
    let mut pair = Pair::connected(ratchet_caps(), ratchet_caps(), ChannelConfig::default());
    pair.a.observer = Recorder::with(|event| match event {
        SessionEvent::FileRequest { .. } => EventReply::accept_file("/tmp/inbox/ledger.csv"),
        _ => EventReply::proceed(),
    });
    let (request, actions) =
        pair.b.session.offer_file("ledger.csv", 2048, 40_003, &mut pair.b.observer).unwrap();
    pair.b.absorb(actions);
    pair.pump();
    assert!(matches!(pair.a.other.as_slice(), [SessionAction::ReceiveFile { .. }]));

    pair.await_ratchet_confirmation();
    let actions = pair.a.session.complete_transfer(request.id, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    assert_eq!(sealed_on_wire(&pair.a), vec![PacketClass::Forwarding]);

    pair.pump();
    assert!(pair.b.observer.errors().is_empty(), "{:?}", pair.b.observer.errors());
    assert!(pair.b.session.is_established());
    assert_eq!(pair.b.other, vec![SessionAction::FinishTransfer { id: request.id }]);
    assert!(pair.b.observer.saw(|e| matches!(e, SessionEvent::FileSent { id } if *id == request.id)));
}

#[test]
fn forward_records_leave_channel_keys_alone() {
    let caps = Capabilities { key_forwarding: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, caps, ChannelConfig::default());
    pair.b.observer = Recorder::with(|event| match event {
        SessionEvent::KeyRequested { .. } => EventReply::key_terms(3600, 7),
        _ => EventReply::proceed(),
    });
    let before = pair.a.session.transmit_key().cloned();

    let actions = pair.a.session.request_key(KeyInstruction::Forward, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    pair.pump();

    assert_eq!(pair.a.session.transmit_key().cloned(), before);
    let synced = pair.a.observer.events.iter().find_map(|event| match event {
        SessionEvent::KeySynchronized { forward, returned } => Some((forward.clone(), returned.clone())),
        _ => None,
    });
    let (forward, returned) = synced.unwrap();
    assert_eq!((forward.lifetime, forward.option), (3600, 7));
    assert_eq!(returned.lifetime, 3600);
    assert_ne!(forward.key, returned.key);
}

#[test]
fn forwarding_refused_when_disabled() {
    let caps = Capabilities { key_forwarding: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, Capabilities::default(), ChannelConfig::default());

    let actions = pair.a.session.request_key(KeyInstruction::Forward, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    pair.pump();

    assert!(matches!(pair.a.observer.errors().as_slice(), [SessionError::Refused(_)]));
    assert!(matches!(pair.b.observer.errors().as_slice(), [SessionError::Refused(_)]));
    assert!(pair.a.session.is_established() && pair.b.session.is_established());
    assert!(pair.a.session.request_key(KeyInstruction::Forward, &mut pair.a.observer).is_ok());
}

#[test]
fn accepted_file_round_trip() {
    let caps = Capabilities { file_transfer: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, caps, ChannelConfig::default());
    pair.b.observer = Recorder::with(|event| match event {
        SessionEvent::FileRequest { .. } => EventReply::accept_file("/tmp/inbox/report.pdf"),
        _ => EventReply::proceed(),
    });

    let (request, actions) =
        pair.a.session.offer_file("report.pdf", 1024, 40_000, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    pair.pump();

    let [SessionAction::ReceiveFile { request: offered, destination }] = pair.b.other.as_slice()
    else {
        panic!("expected one ReceiveFile action, got {:?}", pair.b.other);
    };
    assert_eq!(offered, &request);
    assert_eq!(destination, &PathBuf::from("/tmp/inbox/report.pdf"));

    let actions = pair.b.session.complete_transfer(request.id, &mut pair.b.observer).unwrap();
    pair.b.absorb(actions);
    pair.pump();

    assert_eq!(pair.a.other, vec![SessionAction::FinishTransfer { id: request.id }]);
    assert!(pair.a.observer.saw(|e| matches!(e, SessionEvent::FileSent { id } if *id == request.id)));
    assert!(pair.b.observer.saw(|e| matches!(e, SessionEvent::FileReceived { .. })));
}

#[test]
fn declined_file_aborts_the_sender() {
    let caps = Capabilities { file_transfer: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, caps, ChannelConfig::default());

    let (request, actions) =
        pair.a.session.offer_file("notes.txt", 10, 40_001, &mut pair.a.observer).unwrap();
    pair.a.absorb(actions);
    pair.pump();

    assert_eq!(pair.a.other, vec![SessionAction::AbortTransfer { id: request.id }]);
    assert!(pair.a.observer.saw(|e| matches!(e, SessionEvent::FileRefused { .. })));
    assert!(pair.b.other.is_empty());
}

#[test]
fn retained_keys_resume_the_channel() {
    let caps = Capabilities { retain_ciphers: true, ..Capabilities::default() };
    let mut pair = Pair::connected(caps, caps, ChannelConfig::default());
    let remote_of_a = pair.a.session.remote_identity().clone();
    let remote_of_b = pair.b.session.remote_identity().clone();

    let (actions, keys_a) = pair.a.session.disconnect(TerminateReason::Normal, &mut pair.a.observer);
    pair.a.absorb(actions);
    pair.pump();
    let keys_a = keys_a.unwrap();
    let keys_b = pair.b.session.take_retained_keys().unwrap();
    assert_eq!(keys_a.transmit, keys_b.receive);

    let resumed = |seed, role, public: &str, keys, remote| {
        let setup = setup(role, public, caps, ChannelConfig::default());
        DtmSession::resume(TestEnv::seeded(seed), setup, keys, remote).unwrap()
    };
    let mut pair = Pair {
        a: Peer::from_session(resumed(5, Role::Initiator, "alice", keys_a, remote_of_a)),
        b: Peer::from_session(resumed(6, Role::Responder, "bob", keys_b, remote_of_b)),
    };
    pair.a.send(b"back again");
    pair.pump();
    assert_eq!(pair.b.observer.received(), vec![b"back again".to_vec()]);
}

#[test]
fn disconnect_is_idempotent() {
    let mut pair = Pair::default_connected();
    let (first, keys) = pair.a.session.disconnect(TerminateReason::Normal, &mut pair.a.observer);
    assert_eq!(first.len(), 2);
    assert!(keys.is_none());

    let (second, _) = pair.a.session.disconnect(TerminateReason::Normal, &mut pair.a.observer);
    assert!(second.is_empty());
    assert_eq!(pair.a.session.phase(), None);
}

#[test]
fn application_calls_need_an_established_channel() {
    let mut peer = Peer::new(9, setup(
        Role::Initiator,
        "alice",
        Capabilities::all(),
        ChannelConfig::default(),
    ));
    let mut observer = Recorder::proceeding();
    let observer = &mut observer;

    assert!(matches!(
        peer.session.send_message(b"early", observer),
        Err(SessionError::InvalidState { operation: "send a message", .. })
    ));
    assert!(peer.session.request_key(KeyInstruction::Forward, observer).is_err());
    assert!(peer.session.offer_file("f", 1, 1, observer).is_err());
    assert!(peer.session.request_resync(observer).is_err());
    assert!(peer.session.keepalive_tick(observer).is_empty());
}

#[test]
fn responder_does_not_start() {
    let mut pair =
        Pair::new(Capabilities::default(), Capabilities::default(), ChannelConfig::default());
    let actions = pair.b.session.start(&mut pair.b.observer).unwrap();
    assert!(actions.is_empty());
}
