//! Two Sans-IO sessions wired back to back.
//!
//! Frames a session emits are queued on its node and delivered to the other
//! side when the pair is pumped. Delays are ignored; ordering within one
//! direction is preserved unless a frame is dropped or rewritten.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use dtm_core::{
    DtmSession, EventReply, SessionAction, SessionError, SessionEvent, SessionObserver,
    SessionSetup,
};
use dtm_proto::{PacketClass, PacketHeader};

use crate::sim_env::SimEnv;

/// Upper bound on pump rounds; a pair still chattering after this many is
/// looping.
pub const MAX_ROUNDS: usize = 100_000;

/// Which end of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The side that dials
    Initiator,
    /// The side that listens
    Responder,
}

impl Side {
    /// The other end.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Decides the reply to each event.
pub type Policy = Box<dyn FnMut(&SessionEvent) -> EventReply + Send>;

/// Observer that keeps every event and answers through a policy.
pub struct Recorder {
    /// Every event seen, in order
    pub events: Vec<SessionEvent>,
    policy: Policy,
}

impl Recorder {
    /// Never vetoes.
    pub fn proceeding() -> Self {
        Self::with_policy(|_| EventReply::proceed())
    }

    /// Answers with `policy`.
    pub fn with_policy(policy: impl FnMut(&SessionEvent) -> EventReply + Send + 'static) -> Self {
        Self { events: Vec::new(), policy: Box::new(policy) }
    }

    /// Plaintext delivered as `DataReceived`, in order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::DataReceived { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Errors reported, in order.
    pub fn errors(&self) -> Vec<SessionError> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sequence numbers of framed packets, in transmission order.
    pub fn sent_sequences(&self) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::PacketSent { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.iter().filter(|event| predicate(event)).count()
    }
}

impl SessionObserver for Recorder {
    fn on_event(&mut self, event: &SessionEvent) -> EventReply {
        let reply = (self.policy)(event);
        self.events.push(event.clone());
        reply
    }
}

/// One end: its session, observer, outbound queue and non-send actions.
pub struct Node {
    /// The engine
    pub session: DtmSession<SimEnv>,
    /// Its observer
    pub observer: Recorder,
    /// Actions other than `Send`, in order
    pub effects: Vec<SessionAction>,
    outbox: VecDeque<Bytes>,
}

impl Node {
    fn new(session: DtmSession<SimEnv>) -> Self {
        Self { session, observer: Recorder::proceeding(), effects: Vec::new(), outbox: VecDeque::new() }
    }

    /// Queue the actions a session call returned.
    pub fn absorb(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Send { bytes, .. } => self.outbox.push_back(bytes),
                other => self.effects.push(other),
            }
        }
    }

    /// Run a session call against this node's observer and queue its actions.
    pub fn run(
        &mut self,
        call: impl FnOnce(&mut DtmSession<SimEnv>, &mut Recorder) -> Result<Vec<SessionAction>, SessionError>,
    ) -> Result<(), SessionError> {
        let actions = call(&mut self.session, &mut self.observer)?;
        self.absorb(actions);
        Ok(())
    }

    /// Send application data.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.run(|session, observer| session.send_message(data, observer))
    }

    /// One keepalive period.
    pub fn tick(&mut self) {
        let actions = self.session.keepalive_tick(&mut self.observer);
        self.absorb(actions);
    }

    /// Frames waiting for delivery.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }
}

/// Network misbehaviour applied while pumping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chaos {
    /// Deliver everything queued in one direction as a single chunk
    pub coalesce: bool,
    /// Drop every Nth Message-class frame sent after the channel is up
    pub drop_every: Option<u32>,
}

/// Rewrites or drops frames in flight. Return `None` to drop.
pub type Interceptor = Box<dyn FnMut(Side, Bytes) -> Option<Bytes> + Send>;

/// Initiator and responder connected in memory.
pub struct LoopbackPair {
    initiator: Node,
    responder: Node,
    chaos: Chaos,
    interceptor: Option<Interceptor>,
    messages_seen: u32,
    dropped: u32,
}

impl LoopbackPair {
    /// Pair with independent random streams forked from `seed`.
    pub fn new(seed: u64, initiator: SessionSetup, responder: SessionSetup) -> Self {
        let env = SimEnv::with_seed(seed);
        Self {
            initiator: Node::new(DtmSession::new(env.fork(1), initiator)),
            responder: Node::new(DtmSession::new(env.fork(2), responder)),
            chaos: Chaos::default(),
            interceptor: None,
            messages_seen: 0,
            dropped: 0,
        }
    }

    /// Pair from sessions built elsewhere, such as resumed ones.
    pub fn from_sessions(initiator: DtmSession<SimEnv>, responder: DtmSession<SimEnv>) -> Self {
        Self {
            initiator: Node::new(initiator),
            responder: Node::new(responder),
            chaos: Chaos::default(),
            interceptor: None,
            messages_seen: 0,
            dropped: 0,
        }
    }

    /// Apply `chaos` from now on.
    #[must_use]
    pub fn with_chaos(mut self, chaos: Chaos) -> Self {
        self.chaos = chaos;
        self
    }

    /// Pass every frame through `interceptor` before delivery.
    pub fn intercept(&mut self, interceptor: impl FnMut(Side, Bytes) -> Option<Bytes> + Send + 'static) {
        self.interceptor = Some(Box::new(interceptor));
    }

    /// Remove the interceptor.
    pub fn clear_interceptor(&mut self) {
        self.interceptor = None;
    }

    /// Send the opening packet and pump until quiet. True if both sides
    /// ended established.
    pub fn handshake(&mut self) -> Result<bool, SessionError> {
        self.initiator.run(|session, observer| session.start(observer))?;
        self.pump();
        Ok(self.initiator.session.is_established() && self.responder.session.is_established())
    }

    /// One side.
    pub fn node(&self, side: Side) -> &Node {
        match side {
            Side::Initiator => &self.initiator,
            Side::Responder => &self.responder,
        }
    }

    /// One side, mutably.
    pub fn node_mut(&mut self, side: Side) -> &mut Node {
        match side {
            Side::Initiator => &mut self.initiator,
            Side::Responder => &mut self.responder,
        }
    }

    /// Frames dropped by chaos or the interceptor so far.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Deliver in both directions until neither side has anything queued.
    /// Returns the number of frames that left a sender.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;
        for _ in 0..MAX_ROUNDS {
            let step = self.flush(Side::Initiator) + self.flush(Side::Responder);
            if step == 0 {
                return moved;
            }
            moved += step;
        }
        tracing::warn!(moved, "pump round limit reached");
        moved
    }

    /// Deliver everything `from` has queued right now. Returns the number of
    /// frames taken off its queue.
    pub fn flush(&mut self, from: Side) -> usize {
        let frames: Vec<Bytes> = self.node_mut(from).outbox.drain(..).collect();
        let taken = frames.len();
        let established = self.node(from).session.is_established();

        let mut surviving = Vec::with_capacity(taken);
        for frame in frames {
            if let Some(frame) = self.filter(from, frame, established) {
                surviving.push(frame);
            }
        }

        let coalesce = self.chaos.coalesce;
        let to = self.node_mut(from.peer());
        if to.session.is_closed() {
            return taken;
        }
        if coalesce && surviving.len() > 1 {
            let mut chunk = BytesMut::new();
            for frame in &surviving {
                chunk.extend_from_slice(frame);
            }
            let actions = to.session.handle_bytes(&chunk, &mut to.observer);
            to.absorb(actions);
        } else {
            for frame in surviving {
                let actions = to.session.handle_bytes(&frame, &mut to.observer);
                to.absorb(actions);
            }
        }
        taken
    }

    fn filter(&mut self, from: Side, frame: Bytes, established: bool) -> Option<Bytes> {
        if let Some(every) = self.chaos.drop_every.filter(|n| *n > 0) {
            let is_message = PacketHeader::from_bytes(&frame)
                .ok()
                .and_then(PacketHeader::class)
                .is_some_and(|class| class == PacketClass::Message);
            if established && is_message {
                self.messages_seen += 1;
                if self.messages_seen % every == 0 {
                    self.dropped += 1;
                    tracing::trace!(?from, nth = self.messages_seen, "chaos dropped frame");
                    return None;
                }
            }
        }
        match self.interceptor.as_mut() {
            Some(intercept) => {
                let kept = intercept(from, frame);
                if kept.is_none() {
                    self.dropped += 1;
                }
                kept
            },
            None => Some(frame),
        }
    }
}
