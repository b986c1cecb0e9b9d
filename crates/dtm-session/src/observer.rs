//! Observer that turns session events into a stream.

use dtm_core::{EventReply, SessionEvent, SessionObserver};
use tokio::sync::mpsc;

/// Forwards every event onto an unbounded channel and lets `inner` decide the
/// reply.
///
/// Events are cloned onto the channel before `inner` sees them, so the stream
/// order matches the engine's. A dropped receiver only stops the forwarding.
pub struct ChannelObserver<O> {
    inner: O,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<O: SessionObserver> ChannelObserver<O> {
    /// Wrap `inner`, returning the observer and the event stream.
    pub fn new(inner: O) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, stream) = mpsc::unbounded_channel();
        (Self { inner, events }, stream)
    }
}

impl ChannelObserver<FixedReply> {
    /// Forward every event and answer each with a clone of `reply`.
    pub fn replying(reply: EventReply) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::new(FixedReply(reply))
    }
}

impl<O: SessionObserver> SessionObserver for ChannelObserver<O> {
    fn on_event(&mut self, event: &SessionEvent) -> EventReply {
        if self.events.send(event.clone()).is_err() {
            tracing::trace!("event stream receiver dropped");
        }
        self.inner.on_event(event)
    }
}

/// Gives the same reply to every event.
#[derive(Debug, Clone, Default)]
pub struct FixedReply(pub EventReply);

impl SessionObserver for FixedReply {
    fn on_event(&mut self, _event: &SessionEvent) -> EventReply {
        self.0.clone()
    }
}
