//! Actions returned by the session for a driver to execute.

use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use dtm_proto::TerminateReason;

use crate::payloads::TransferRequest;

/// Work the driver must perform on the session's behalf.
///
/// Actions are ordered: a driver must execute them in the order returned,
/// and must honour each `Send` delay before writing that frame and any frame
/// after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write a framed packet to the transport
    Send {
        /// Encoded frame
        bytes: Bytes,
        /// Wait this long before writing
        delay: Duration,
    },

    /// Reply to a pending blocking request, decrypted
    Response(Vec<u8>),

    /// Connect to the sender's ephemeral listener and receive a file
    ReceiveFile {
        /// The accepted offer
        request: TransferRequest,
        /// Where to write it
        destination: PathBuf,
    },

    /// The peer confirmed an outgoing transfer; release its resources
    FinishTransfer {
        /// Transfer id
        id: u64,
    },

    /// The peer refused an outgoing transfer; stop serving it
    AbortTransfer {
        /// Transfer id
        id: u64,
    },

    /// Re-open the transport to the same endpoint, then call
    /// `DtmSession::request_resync`
    Reconnect,

    /// Close the transport
    Close {
        /// Why the session ended
        reason: TerminateReason,
    },
}

impl SessionAction {
    /// A send with no delay.
    pub fn send(bytes: Bytes) -> Self {
        Self::Send { bytes, delay: Duration::ZERO }
    }
}
