//! Session events and the observer that answers them.
//!
//! Every notification the engine produces goes through one ordered
//! [`SessionObserver::on_event`] call per connection. The returned
//! [`EventReply`] carries the application's decision back: cancel the
//! handshake, refuse a transfer, pick a destination path, set forwarding
//! terms. Informational events ignore the reply.

use std::path::{Path, PathBuf};

use dtm_crypto::SymmetricSession;
use dtm_proto::{PacketClass, Phase, TerminateReason};

use crate::{
    error::{SessionError, Severity},
    identity::RemoteIdentity,
    payloads::{ForwardRecord, KeyInstruction, TransferRequest},
};

/// Something the application may want to know about or decide on.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Peer identity learned or extended during the handshake. Cancelable.
    IdentityReceived {
        /// Phase that delivered it
        phase: Phase,
        /// Everything known about the peer so far
        identity: RemoteIdentity,
    },

    /// A packet was consumed in order.
    PacketReceived {
        /// Packet class
        class: PacketClass,
        /// Sub-type flag
        flag: u16,
        /// Sequence number
        sequence: u32,
    },

    /// A packet was framed for transmission.
    PacketSent {
        /// Packet class
        class: PacketClass,
        /// Sub-type flag
        flag: u16,
        /// Sequence number
        sequence: u32,
    },

    /// Both channel ciphers are live.
    Established {
        /// Descriptor keying the outbound cipher
        transmit: SymmetricSession,
        /// Descriptor keying the inbound cipher
        receive: SymmetricSession,
    },

    /// Decrypted application data.
    DataReceived {
        /// Plaintext
        data: Vec<u8>,
        /// True if the peer is blocking for a single reply
        request: bool,
    },

    /// An error on the receive path. Cancelable; fatal errors close the
    /// session regardless.
    Error {
        /// Triage class
        severity: Severity,
        /// What went wrong
        error: SessionError,
    },

    /// Peer offers a file. Reply with a destination to accept.
    FileRequest {
        /// The offer
        request: TransferRequest,
    },

    /// Peer declined our offer.
    FileRefused {
        /// Transfer id
        id: u64,
    },

    /// An incoming transfer finished.
    FileReceived {
        /// Transfer id
        id: u64,
    },

    /// Peer confirmed receipt of our file.
    FileSent {
        /// Transfer id
        id: u64,
    },

    /// Transfer progress.
    FileProgress {
        /// Transfer id
        id: u64,
        /// Percentage complete, 0 to 100
        percent: u8,
    },

    /// Peer asks for a forward record. Reply with lifetime and option, or
    /// cancel to refuse.
    KeyRequested {
        /// What the records will be used for
        instruction: KeyInstruction,
    },

    /// Both forwarding records are in place. Cancelable.
    KeySynchronized {
        /// Record this side generated
        forward: ForwardRecord,
        /// Record the peer generated
        returned: ForwardRecord,
    },

    /// The peer closed the session.
    Terminated {
        /// Reason the peer gave
        reason: TerminateReason,
    },
}

/// The application's answer to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventReply {
    /// Veto the operation the event describes
    pub cancel: bool,
    /// Reason sent to the peer when a cancel tears the session down
    pub reason: Option<TerminateReason>,
    /// Where to store an offered file
    pub destination: Option<PathBuf>,
    /// Lifetime placed in a forward record
    pub key_lifetime: u64,
    /// Option placed in a forward record
    pub key_option: i64,
}

impl EventReply {
    /// Carry on.
    pub fn proceed() -> Self {
        Self::default()
    }

    /// Veto with the default reason.
    pub fn cancel() -> Self {
        Self { cancel: true, ..Self::default() }
    }

    /// Veto with a specific reason for the peer.
    pub fn cancel_with(reason: TerminateReason) -> Self {
        Self { cancel: true, reason: Some(reason), ..Self::default() }
    }

    /// Accept an offered file into `path`.
    pub fn accept_file(path: impl Into<PathBuf>) -> Self {
        Self { destination: Some(path.into()), ..Self::default() }
    }

    /// Answer a key request with these record terms.
    pub fn key_terms(lifetime: u64, option: i64) -> Self {
        Self { key_lifetime: lifetime, key_option: option, ..Self::default() }
    }
}

/// Receives every event of one session, in order.
pub trait SessionObserver {
    /// Handle `event` and return the application's decision.
    fn on_event(&mut self, event: &SessionEvent) -> EventReply;
}

impl<F> SessionObserver for F
where
    F: FnMut(&SessionEvent) -> EventReply,
{
    fn on_event(&mut self, event: &SessionEvent) -> EventReply {
        self(event)
    }
}

/// Observer that never vetoes. Offered files are accepted into
/// `download_dir` when one is set and refused otherwise.
#[derive(Debug, Clone, Default)]
pub struct AcceptAll {
    /// Directory for accepted files
    pub download_dir: Option<PathBuf>,
}

impl SessionObserver for AcceptAll {
    fn on_event(&mut self, event: &SessionEvent) -> EventReply {
        match event {
            SessionEvent::FileRequest { request } => {
                let destination = self.download_dir.as_ref().and_then(|dir| {
                    Path::new(&request.file_name).file_name().map(|name| dir.join(name))
                });
                EventReply { destination, ..EventReply::default() }
            },
            _ => EventReply::proceed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use dtm_crypto::{KeyMaterial, SymmetricCipherKind};

    use super::*;

    fn offer(name: &str) -> SessionEvent {
        let session = SymmetricSession::native(SymmetricCipherKind::ChaCha20);
        SessionEvent::FileRequest {
            request: TransferRequest {
                id: 1,
                file_name: name.to_string(),
                size: 10,
                port: 4000,
                session,
                key: KeyMaterial::generate(&session, |b| b.fill(1)),
            },
        }
    }

    #[test]
    fn closures_are_observers() {
        let mut seen = 0;
        let mut observer = |_: &SessionEvent| {
            seen += 1;
            EventReply::cancel()
        };
        let reply = observer.on_event(&SessionEvent::FileSent { id: 3 });
        assert!(reply.cancel);
        assert_eq!(seen, 1);
    }

    #[test]
    fn accept_all_refuses_files_without_a_directory() {
        let reply = AcceptAll::default().on_event(&offer("notes.txt"));
        assert_eq!(reply.destination, None);
        assert!(!reply.cancel);
    }

    #[test]
    fn accept_all_strips_directories_from_offered_names() {
        let mut observer = AcceptAll { download_dir: Some(PathBuf::from("/tmp/inbox")) };
        let reply = observer.on_event(&offer("../../etc/passwd"));
        assert_eq!(reply.destination, Some(PathBuf::from("/tmp/inbox/passwd")));
    }
}
