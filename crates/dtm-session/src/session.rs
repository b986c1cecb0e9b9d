//! Application-facing session handle.

use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use dtm_core::{
    ChannelKeys, DtmParameters, DtmSession, KeyInstruction, RemoteIdentity, Role, SessionError,
    SessionObserver,
};
use dtm_proto::TerminateReason;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
};

use crate::{
    config::SessionConfig,
    driver::{Command, Driver, Handles, Link},
    error::TransportError,
    system_env::SystemEnv,
};

/// Where a resumed session finds its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Dial the peer
    Connect(SocketAddr),
    /// Wait for the peer on this address
    Listen(SocketAddr),
}

/// Lifecycle of a session as seen from the application.
#[derive(Debug, Clone)]
pub enum SessionStatus {
    /// Handshake in progress
    Handshaking,
    /// Channel ciphers live
    Established {
        /// Negotiated bundle
        parameters: DtmParameters,
        /// What the handshake learned about the peer
        remote: RemoteIdentity,
    },
    /// Session over
    Closed {
        /// Last error raised, if the session did not end cleanly
        error: Option<SessionError>,
        /// Reason given by whichever side closed
        reason: Option<TerminateReason>,
    },
}

/// Handle to a running session.
///
/// Every method queues a command for the connection's driver task, so calls
/// from several tasks are serialized in arrival order. Dropping the handle
/// disconnects with [`TerminateReason::Normal`].
pub struct Session {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    retained: Arc<Mutex<Option<ChannelKeys>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Session {
    /// Dial `addr` and run the handshake as initiator.
    ///
    /// Returns once the channel is established.
    ///
    /// # Errors
    ///
    /// - `TransportError::Connection` if the peer cannot be reached
    /// - `TransportError::Handshake` if the handshake fails, times out or is
    ///   vetoed
    pub async fn connect(
        addr: SocketAddr,
        config: SessionConfig,
        observer: impl SessionObserver + Send + 'static,
    ) -> Result<Self, TransportError> {
        let stream = dial(addr, config.channel.handshake_timeout).await?;
        let engine = DtmSession::new(SystemEnv::new(), config.setup(Role::Initiator));
        let session = Self::spawn(stream, Link::Dial(addr), engine, config, Box::new(observer))?;
        session.wait_established().await?;
        Ok(session)
    }

    /// Bind `addr`, accept one connection and run the handshake as
    /// responder. The listener is kept for reconnects.
    ///
    /// # Errors
    ///
    /// - `TransportError::Connection` if binding or accepting fails
    /// - `TransportError::Handshake` if the handshake fails
    pub async fn listen(
        addr: SocketAddr,
        config: SessionConfig,
        observer: impl SessionObserver + Send + 'static,
    ) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(addr).await.map_err(|e| TransportError::connection("bind", &e))?;
        let (stream, peer) =
            listener.accept().await.map_err(|e| TransportError::connection("accept", &e))?;
        tracing::info!(%peer, "connection accepted");
        let engine = DtmSession::new(SystemEnv::new(), config.setup(Role::Responder));
        let session =
            Self::spawn(stream, Link::Accept(listener), engine, config, Box::new(observer))?;
        session.wait_established().await?;
        Ok(session)
    }

    /// Open `endpoint` and continue a channel with keys kept from an earlier
    /// session, skipping the handshake.
    ///
    /// Both sides must resume with mirrored keys: one side's transmit key is
    /// the other's receive key.
    pub async fn resume(
        endpoint: Endpoint,
        config: SessionConfig,
        keys: ChannelKeys,
        remote: RemoteIdentity,
        observer: impl SessionObserver + Send + 'static,
    ) -> Result<Self, TransportError> {
        let (stream, link, role) = match endpoint {
            Endpoint::Connect(addr) => {
                (dial(addr, config.channel.handshake_timeout).await?, Link::Dial(addr), Role::Initiator)
            },
            Endpoint::Listen(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| TransportError::connection("bind", &e))?;
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|e| TransportError::connection("accept", &e))?;
                (stream, Link::Accept(listener), Role::Responder)
            },
        };
        let engine = DtmSession::resume(SystemEnv::new(), config.setup(role), keys, remote)?;
        Self::spawn(stream, link, engine, config, Box::new(observer))
    }

    fn spawn(
        stream: TcpStream,
        link: Link,
        engine: DtmSession<SystemEnv>,
        config: SessionConfig,
        observer: Box<dyn SessionObserver + Send>,
    ) -> Result<Self, TransportError> {
        let Handles { commands, status, retained, local_addr, peer_addr } =
            Driver::spawn(stream, link, engine, config, observer)?;
        Ok(Self { commands, status, retained, local_addr, peer_addr })
    }

    /// Encrypt and send `data`, returning once it has been written.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let (done, ack) = oneshot::channel();
        self.command(Command::Send { data: data.to_vec(), done: Some(done) }).await?;
        ack.await.map_err(|_| TransportError::Closed)?
    }

    /// Queue `data` without waiting for the write.
    pub async fn send_async(&self, data: &[u8]) -> Result<(), TransportError> {
        self.command(Command::Send { data: data.to_vec(), done: None }).await
    }

    /// Send a request and wait for the peer's next message as its reply.
    ///
    /// # Errors
    ///
    /// - `TransportError::Timeout` if nothing arrives within `timeout`; the
    ///   request is then cancelled and a late reply is delivered as ordinary
    ///   data
    /// - `TransportError::Session` if another request is already pending
    pub async fn send_receive(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Request { data: data.to_vec(), reply }).await?;
        match tokio::time::timeout(timeout, response).await {
            Ok(outcome) => outcome.map_err(|_| TransportError::Closed)?,
            Err(_) => {
                self.command(Command::CancelRequest).await?;
                Err(TransportError::Timeout(timeout))
            },
        }
    }

    /// Offer the file at `path` to the peer. Returns the transfer id; the
    /// observer sees `FileSent` or `FileRefused` for it later.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<u64, TransportError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| TransportError::Transfer(format!("{}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(TransportError::Transfer(format!("{} is not a regular file", path.display())));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TransportError::Transfer(format!("{} has no file name", path.display())))?;

        let (reply, id) = oneshot::channel();
        self.command(Command::OfferFile { path, name, size: metadata.len(), reply }).await?;
        id.await.map_err(|_| TransportError::Closed)?
    }

    /// Start a key-forwarding exchange.
    pub async fn forward_key_request(&self, instruction: KeyInstruction) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.command(Command::ForwardKey { instruction, reply }).await?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    /// Ask the peer to realign our inbound keystream.
    pub async fn request_resync(&self) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Resync { reply }).await?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    /// Drop the connection, open a new one to the same endpoint and resync.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.command(Command::Reconnect { reply }).await?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    /// Close the session. Returns the channel keys when
    /// `Capabilities::retain_ciphers` is set and the channel was live.
    pub async fn disconnect(&self, reason: TerminateReason) -> Option<ChannelKeys> {
        let (done, keys) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reason, done }).await.is_ok() {
            if let Ok(keys) = keys.await {
                return keys;
            }
        }
        self.retained.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// True while the channel ciphers are live.
    pub fn is_established(&self) -> bool {
        matches!(*self.status.borrow(), SessionStatus::Established { .. })
    }

    /// Wait until the handshake finishes.
    pub async fn wait_established(&self) -> Result<(), TransportError> {
        let mut status = self.status.clone();
        loop {
            if let Some(outcome) = settled(&status.borrow_and_update()) {
                return outcome;
            }
            if status.changed().await.is_err() {
                return settled(&status.borrow()).unwrap_or(Err(TransportError::Closed));
            }
        }
    }

    /// Wait until the session closes and return its final state.
    pub async fn closed(&self) -> SessionStatus {
        let mut status = self.status.clone();
        loop {
            if matches!(*status.borrow_and_update(), SessionStatus::Closed { .. }) {
                break;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
        status.borrow().clone()
    }

    /// Local socket address of the main connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer socket address of the main connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    async fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands.send(command).await.map_err(|_| TransportError::Closed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

fn settled(status: &SessionStatus) -> Option<Result<(), TransportError>> {
    match status {
        SessionStatus::Handshaking => None,
        SessionStatus::Established { .. } => Some(Ok(())),
        SessionStatus::Closed { error: Some(error), .. } => {
            Some(Err(TransportError::Handshake(error.clone())))
        },
        SessionStatus::Closed { error: None, reason } => Some(Err(TransportError::Handshake(
            SessionError::PeerTerminated(format!("{reason:?}")),
        ))),
    }
}

async fn dial(addr: SocketAddr, limit: Duration) -> Result<TcpStream, TransportError> {
    tokio::time::timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(limit))?
        .map_err(|e| TransportError::connection("connect", &e))
}

/// Accepts any number of responder sessions on one address.
#[derive(Debug)]
pub struct SessionListener {
    listener: TcpListener,
}

impl SessionListener {
    /// Bind `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(addr).await.map_err(|e| TransportError::connection("bind", &e))?;
        Ok(Self { listener })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(|e| TransportError::connection("local address", &e))
    }

    /// Accept the next connection and run the handshake as responder.
    ///
    /// Sessions accepted here cannot reconnect: the listener is shared, so a
    /// new connection cannot be attributed to this session.
    pub async fn accept(
        &self,
        config: SessionConfig,
        observer: impl SessionObserver + Send + 'static,
    ) -> Result<Session, TransportError> {
        let (stream, peer) =
            self.listener.accept().await.map_err(|e| TransportError::connection("accept", &e))?;
        tracing::info!(%peer, "connection accepted");
        let engine = DtmSession::new(SystemEnv::new(), config.setup(Role::Responder));
        let session = Session::spawn(stream, Link::Fixed, engine, config, Box::new(observer))?;
        session.wait_established().await?;
        Ok(session)
    }
}
