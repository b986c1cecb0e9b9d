//! Per-connection driver task.
//!
//! One task owns the Sans-IO [`DtmSession`] and the socket's write half.
//! Application calls, transport reads, keepalive ticks and transfer tasks all
//! reach it as messages, so only one thing ever transmits at a time and the
//! cipher swap at a ratchet can never race an in-flight encrypt.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use dtm_core::{
    ChannelKeys, DtmSession, EventReply, KeyInstruction, SessionAction, SessionError,
    SessionEvent, SessionObserver, TransferRequest,
};
use dtm_proto::{Phase, TerminateReason};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{mpsc, oneshot, watch},
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    config::SessionConfig,
    error::TransportError,
    session::SessionStatus,
    system_env::SystemEnv,
    transfer,
    transport::{ReadEvent, read_loop, write_frame},
};

/// Bound on queued application commands.
pub(crate) const COMMAND_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

/// Work sent to the driver.
pub(crate) enum Command {
    Send { data: Vec<u8>, done: Option<Reply<()>> },
    Request { data: Vec<u8>, reply: Reply<Vec<u8>> },
    CancelRequest,
    OfferFile { path: PathBuf, name: String, size: u64, reply: Reply<u64> },
    ForwardKey { instruction: KeyInstruction, reply: Reply<()> },
    Resync { reply: Reply<()> },
    Reconnect { reply: Reply<()> },
    Disconnect { reason: TerminateReason, done: oneshot::Sender<Option<ChannelKeys>> },
    Progress { id: u64, percent: u8 },
    TransferDone { id: u64, incoming: bool, outcome: Result<(), TransportError> },
}

/// Frames waiting out their send delay.
///
/// Frames leave in the order the engine queued them, so a delayed frame also
/// holds back every frame queued after it.
#[derive(Debug, Default)]
struct Outgoing {
    frames: VecDeque<(Instant, Bytes)>,
}

impl Outgoing {
    /// Queue `bytes` unless it can be written right away, in which case it is
    /// handed back.
    fn push(&mut self, now: Instant, delay: Duration, bytes: Bytes) -> Option<Bytes> {
        if delay.is_zero() && self.frames.is_empty() {
            return Some(bytes);
        }
        self.frames.push_back((now + delay, bytes));
        None
    }

    /// When the front frame may be written.
    fn next_due(&self) -> Option<Instant> {
        self.frames.front().map(|(due, _)| *due)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Bytes> {
        if self.next_due()? > now {
            return None;
        }
        self.frames.pop_front().map(|(_, bytes)| bytes)
    }

    fn pop_any(&mut self) -> Option<Bytes> {
        self.frames.pop_front().map(|(_, bytes)| bytes)
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

/// How a lost connection is re-opened.
pub(crate) enum Link {
    /// Dial the peer again
    Dial(SocketAddr),
    /// Accept the next connection on our own listener
    Accept(TcpListener),
    /// Accepted from a shared listener; cannot be re-opened
    Fixed,
}

impl Link {
    async fn open(&self, limit: Duration) -> Result<TcpStream, TransportError> {
        let opened = match self {
            Self::Dial(addr) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map(|r| r.map_err(|e| TransportError::connection("reconnect", &e))),
            Self::Accept(listener) => tokio::time::timeout(limit, listener.accept())
                .await
                .map(|r| r.map(|(stream, _)| stream).map_err(|e| TransportError::connection("accept", &e))),
            Self::Fixed => {
                return Err(TransportError::Connection(
                    "connection came from a shared listener and cannot be re-opened".to_string(),
                ));
            },
        };
        opened.map_err(|_| TransportError::Timeout(limit))?
    }
}

/// Records what the driver needs to know about events before handing them to
/// the application's observer.
struct Tap {
    inner: Box<dyn SessionObserver + Send>,
    last_error: Option<SessionError>,
    terminated: Option<TerminateReason>,
}

impl SessionObserver for Tap {
    fn on_event(&mut self, event: &SessionEvent) -> EventReply {
        match event {
            SessionEvent::Error { error, .. } => self.last_error = Some(error.clone()),
            SessionEvent::Terminated { reason } => self.terminated = Some(*reason),
            _ => {},
        }
        self.inner.on_event(event)
    }
}

/// Channels and shared state the handle keeps.
pub(crate) struct Handles {
    pub commands: mpsc::Sender<Command>,
    pub status: watch::Receiver<SessionStatus>,
    pub retained: Arc<Mutex<Option<ChannelKeys>>>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

pub(crate) struct Driver {
    session: DtmSession<SystemEnv>,
    observer: Tap,
    config: SessionConfig,

    link: Link,
    writer: Option<OwnedWriteHalf>,
    outgoing: Outgoing,
    reader: Option<AbortHandle>,
    generation: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Command>,
    internal: mpsc::UnboundedReceiver<Command>,
    reads_tx: mpsc::UnboundedSender<ReadEvent>,
    reads: mpsc::UnboundedReceiver<ReadEvent>,

    pending_request: Option<Reply<Vec<u8>>>,
    transfers: HashMap<u64, AbortHandle>,
    phase: Option<Phase>,
    phase_since: Instant,
    close_reason: Option<TerminateReason>,
    status: watch::Sender<SessionStatus>,
    retained: Arc<Mutex<Option<ChannelKeys>>>,
}

impl Driver {
    /// Spawn the driver for an open connection and return the handle's side.
    pub(crate) fn spawn(
        stream: TcpStream,
        link: Link,
        session: DtmSession<SystemEnv>,
        config: SessionConfig,
        observer: Box<dyn SessionObserver + Send>,
    ) -> Result<Handles, TransportError> {
        let local_addr = stream.local_addr().map_err(|e| TransportError::connection("local address", &e))?;
        let peer_addr = stream.peer_addr().map_err(|e| TransportError::connection("peer address", &e))?;

        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (reads_tx, reads) = mpsc::unbounded_channel();
        let initial = if session.is_established() {
            SessionStatus::Established {
                parameters: session.parameters(),
                remote: session.remote_identity().clone(),
            }
        } else {
            SessionStatus::Handshaking
        };
        let (status, status_rx) = watch::channel(initial);
        let retained = Arc::new(Mutex::new(None));

        let mut driver = Self {
            phase: session.phase(),
            session,
            observer: Tap { inner: observer, last_error: None, terminated: None },
            config,
            link,
            writer: None,
            outgoing: Outgoing::default(),
            reader: None,
            generation: 0,
            local_addr,
            peer_addr,
            commands,
            internal_tx,
            internal,
            reads_tx,
            reads,
            pending_request: None,
            transfers: HashMap::new(),
            phase_since: Instant::now(),
            close_reason: None,
            status,
            retained: Arc::clone(&retained),
        };
        driver.attach(stream);
        tokio::spawn(driver.run());

        Ok(Handles { commands: commands_tx, status: status_rx, retained, local_addr, peer_addr })
    }

    async fn run(mut self) {
        tracing::debug!(role = ?self.session.role(), peer = %self.peer_addr, "driver started");

        let actions = match self.session.start(&mut self.observer) {
            Ok(actions) => actions,
            Err(error) => self.session.abort(error, &mut self.observer),
        };
        self.execute(actions).await;

        let period = self.config.channel.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.session.is_closed() {
            let (armed, deadline) = match self.handshake_deadline() {
                Some(at) => (true, at),
                None => (false, Instant::now()),
            };
            let (writing, write_at) = match self.outgoing.next_due() {
                Some(at) => (true, at),
                None => (false, Instant::now()),
            };

            tokio::select! {
                Some(event) = self.reads.recv() => self.on_read(event).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        tracing::debug!("session handle dropped");
                        let (actions, keys) =
                            self.session.disconnect(TerminateReason::Normal, &mut self.observer);
                        self.execute(actions).await;
                        self.stash(keys);
                    },
                },
                Some(command) = self.internal.recv() => self.on_command(command).await,
                _ = keepalive.tick() => {
                    let actions = self.session.keepalive_tick(&mut self.observer);
                    self.execute(actions).await;
                },
                () = tokio::time::sleep_until(write_at), if writing => {
                    let actions = self.flush_outgoing(false).await;
                    self.execute(actions).await;
                },
                () = tokio::time::sleep_until(deadline), if armed => {
                    let error = SessionError::HandshakeTimeout {
                        phase: self.phase,
                        elapsed: self.phase_since.elapsed(),
                    };
                    let actions = self.session.abort(error, &mut self.observer);
                    self.execute(actions).await;
                },
            }
        }

        self.finish().await;
    }

    fn handshake_deadline(&self) -> Option<Instant> {
        if self.session.is_established() || self.session.is_closed() {
            return None;
        }
        Some(self.phase_since + self.config.channel.handshake_timeout)
    }

    async fn on_read(&mut self, event: ReadEvent) {
        match event {
            ReadEvent::Chunk(generation, bytes) if generation == self.generation => {
                let actions = self.session.handle_bytes(&bytes, &mut self.observer);
                self.execute(actions).await;
            },
            ReadEvent::Closed(generation, reason) if generation == self.generation => {
                let actions = self.connection_lost(reason).await;
                self.execute(actions).await;
            },
            ReadEvent::Chunk(generation, _) | ReadEvent::Closed(generation, _) => {
                tracing::trace!(generation, current = self.generation, "stale read ignored");
            },
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { data, done } => {
                let outcome = match self.session.send_message(&data, &mut self.observer) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        self.still_open()
                    },
                    Err(error) => Err(error.into()),
                };
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            },
            Command::Request { data, reply } => {
                match self.session.prepare_request(&data, &mut self.observer) {
                    Ok(actions) => {
                        self.pending_request = Some(reply);
                        self.execute(actions).await;
                    },
                    Err(error) => {
                        let _ = reply.send(Err(error.into()));
                    },
                }
            },
            Command::CancelRequest => {
                self.session.cancel_request();
                self.pending_request = None;
            },
            Command::OfferFile { path, name, size, reply } => {
                let outcome = self.offer_file(path, &name, size).await;
                let _ = reply.send(outcome);
            },
            Command::ForwardKey { instruction, reply } => {
                let outcome = self.session.request_key(instruction, &mut self.observer);
                let _ = reply.send(self.run_checked(outcome).await);
            },
            Command::Resync { reply } => {
                let outcome = self.session.request_resync(&mut self.observer);
                let _ = reply.send(self.run_checked(outcome).await);
            },
            Command::Reconnect { reply } => {
                if self.session.is_established() {
                    tracing::info!("reconnect requested");
                    let actions = self.reconnect().await;
                    self.execute(actions).await;
                    let _ = reply.send(self.still_open());
                } else {
                    let _ = reply.send(Err(SessionError::InvalidState {
                        state: "not established".to_string(),
                        operation: "reconnect",
                    }
                    .into()));
                }
            },
            Command::Disconnect { reason, done } => {
                let (actions, keys) = self.session.disconnect(reason, &mut self.observer);
                self.execute(actions).await;
                if let Err(keys) = done.send(keys) {
                    self.stash(keys);
                }
            },
            Command::Progress { id, percent } => {
                self.session.report_progress(id, percent, &mut self.observer);
            },
            Command::TransferDone { id, incoming, outcome } => {
                self.transfers.remove(&id);
                let result = match outcome {
                    Ok(()) if incoming => self.session.complete_transfer(id, &mut self.observer),
                    Ok(()) => {
                        tracing::debug!(id, "file served, awaiting receipt");
                        return;
                    },
                    Err(error) => {
                        tracing::warn!(id, %error, "transfer failed");
                        self.session.abandon_transfer(id, &mut self.observer)
                    },
                };
                match result {
                    Ok(actions) => self.execute(actions).await,
                    Err(error) => tracing::debug!(id, %error, "transfer outcome not reported"),
                }
            },
        }
    }

    async fn run_checked(
        &mut self,
        outcome: Result<Vec<SessionAction>, SessionError>,
    ) -> Result<(), TransportError> {
        let actions = outcome?;
        self.execute(actions).await;
        self.still_open()
    }

    fn still_open(&self) -> Result<(), TransportError> {
        if self.session.is_closed() { Err(TransportError::Closed) } else { Ok(()) }
    }

    async fn offer_file(&mut self, path: PathBuf, name: &str, size: u64) -> Result<u64, TransportError> {
        let listener = TcpListener::bind(SocketAddr::new(self.local_addr.ip(), 0))
            .await
            .map_err(|e| TransportError::Transfer(format!("ephemeral listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::Transfer(format!("ephemeral listener: {e}")))?
            .port();

        let (request, actions) = self.session.offer_file(name, size, port, &mut self.observer)?;
        let id = request.id;
        let progress = self.progress_sink(id);
        let work = transfer::serve_file(
            listener,
            path,
            request,
            self.config.transfer_chunk_size,
            self.config.transfer_accept_timeout,
            progress,
        );
        self.spawn_transfer(id, false, work);
        self.execute(actions).await;
        Ok(id)
    }

    fn receive(&mut self, request: TransferRequest, destination: PathBuf) {
        let id = request.id;
        let addr = SocketAddr::new(self.peer_addr.ip(), request.port);
        let progress = self.progress_sink(id);
        let work = transfer::receive_file(
            addr,
            request,
            destination,
            self.config.transfer_chunk_size,
            self.config.transfer_accept_timeout,
            progress,
        );
        self.spawn_transfer(id, true, work);
    }

    fn progress_sink(&self, id: u64) -> impl FnMut(u8) + Send + 'static {
        let tx = self.internal_tx.clone();
        move |percent| {
            let _ = tx.send(Command::Progress { id, percent });
        }
    }

    fn spawn_transfer<F>(&mut self, id: u64, incoming: bool, work: F)
    where
        F: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = work.await;
            let _ = tx.send(Command::TransferDone { id, incoming, outcome });
        });
        if let Some(previous) = self.transfers.insert(id, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Run actions in order. Follow-up actions produced while performing one
    /// run before anything queued after it.
    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            let follow_up = self.perform(action).await;
            for next in follow_up.into_iter().rev() {
                queue.push_front(next);
            }
        }
        self.publish();
    }

    async fn perform(&mut self, action: SessionAction) -> Vec<SessionAction> {
        match action {
            SessionAction::Send { bytes, delay } => match self.outgoing.push(Instant::now(), delay, bytes) {
                Some(bytes) => self.write(&bytes).await,
                None => {
                    tracing::trace!(?delay, queued = self.outgoing.len(), "frame delayed");
                    Vec::new()
                },
            },
            SessionAction::Response(data) => {
                match self.pending_request.take() {
                    Some(reply) => {
                        let _ = reply.send(Ok(data));
                    },
                    None => tracing::debug!("response with no waiting caller"),
                }
                Vec::new()
            },
            SessionAction::ReceiveFile { request, destination } => {
                self.receive(request, destination);
                Vec::new()
            },
            SessionAction::FinishTransfer { id } => {
                self.transfers.remove(&id);
                Vec::new()
            },
            SessionAction::AbortTransfer { id } => {
                if let Some(task) = self.transfers.remove(&id) {
                    task.abort();
                }
                Vec::new()
            },
            SessionAction::Reconnect => self.reconnect().await,
            SessionAction::Close { reason } => {
                self.close_reason = Some(reason);
                // The terminate notice may sit behind delayed frames.
                self.flush_outgoing(true).await;
                self.close_transport().await;
                Vec::new()
            },
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Vec<SessionAction> {
        let Some(writer) = self.writer.as_mut() else {
            tracing::trace!(len = bytes.len(), "no connection, frame dropped");
            return Vec::new();
        };
        match write_frame(writer, bytes).await {
            Ok(()) => Vec::new(),
            Err(error) => self.connection_lost(error.to_string()).await,
        }
    }

    /// Write delayed frames that are due, or all of them when `all` is set.
    /// Stops at the first write that loses the connection.
    async fn flush_outgoing(&mut self, all: bool) -> Vec<SessionAction> {
        let now = Instant::now();
        loop {
            let next = if all { self.outgoing.pop_any() } else { self.outgoing.pop_due(now) };
            let Some(bytes) = next else { return Vec::new() };
            let follow_up = self.write(&bytes).await;
            if !follow_up.is_empty() {
                return follow_up;
            }
        }
    }

    async fn connection_lost(&mut self, reason: String) -> Vec<SessionAction> {
        if self.session.is_closed() {
            return Vec::new();
        }
        if self.session.is_established() && self.session.capabilities().auto_reconnect {
            tracing::warn!(%reason, "connection lost, reconnecting");
            return self.reconnect().await;
        }
        self.session.abort(SessionError::Transport(reason), &mut self.observer)
    }

    async fn reconnect(&mut self) -> Vec<SessionAction> {
        self.close_transport().await;
        match self.link.open(self.config.channel.handshake_timeout).await {
            Ok(stream) => {
                self.attach(stream);
                tracing::info!(peer = %self.peer_addr, generation = self.generation, "reconnected");
                match self.session.request_resync(&mut self.observer) {
                    Ok(actions) => actions,
                    Err(error) => {
                        tracing::debug!(%error, "resync not requested");
                        Vec::new()
                    },
                }
            },
            Err(error) => {
                self.session.abort(SessionError::Transport(error.to_string()), &mut self.observer)
            },
        }
    }

    fn attach(&mut self, stream: TcpStream) {
        if let Ok(peer) = stream.peer_addr() {
            self.peer_addr = peer;
        }
        if let Ok(local) = stream.local_addr() {
            self.local_addr = local;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "TCP_NODELAY not set");
        }

        self.generation += 1;
        let (read, write) = stream.into_split();
        self.writer = Some(write);
        let reader = tokio::spawn(read_loop(
            read,
            self.reads_tx.clone(),
            self.config.channel.max_payload,
            self.generation,
        ));
        if let Some(previous) = self.reader.replace(reader.abort_handle()) {
            previous.abort();
        }
    }

    async fn close_transport(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(error = %e, "shutdown failed");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn publish(&mut self) {
        let phase = self.session.phase();
        if phase != self.phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "phase changed");
            self.phase = phase;
            self.phase_since = Instant::now();
        }

        let status = if self.session.is_closed() {
            SessionStatus::Closed {
                error: self.observer.last_error.clone(),
                reason: self.observer.terminated.or(self.close_reason),
            }
        } else if self.session.is_established() {
            SessionStatus::Established {
                parameters: self.session.parameters(),
                remote: self.session.remote_identity().clone(),
            }
        } else {
            SessionStatus::Handshaking
        };
        self.status.send_if_modified(|current| {
            if std::mem::discriminant(current) == std::mem::discriminant(&status) {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn stash(&mut self, keys: Option<ChannelKeys>) {
        let Some(keys) = keys else { return };
        if let Ok(mut slot) = self.retained.lock() {
            *slot = Some(keys);
        }
    }

    async fn finish(mut self) {
        let keys = self.session.take_retained_keys();
        self.stash(keys);
        if let Some(reply) = self.pending_request.take() {
            let _ = reply.send(Err(TransportError::Closed));
        }
        for (id, task) in self.transfers.drain() {
            tracing::debug!(id, "transfer cancelled by close");
            task.abort();
        }
        self.close_transport().await;
        self.publish();
        tracing::debug!(peer = %self.peer_addr, "driver stopped");
    }
}
