//! File transfer negotiation.
//!
//! The file itself moves over a separate ephemeral connection the driver
//! opens; the session only carries the offer, the answer and the final
//! receipt:
//!
//! ```text
//! Sender                         Receiver
//!   Request(TransferRequest) ───►
//!                            ◄───  Refused             (declined, or abandoned)
//!            ... ephemeral connection, file bytes ...
//!                            ◄───  Received            (after the last byte)
//! ```

use std::{collections::BTreeSet, time::Duration};

use dtm_crypto::KeyMaterial;
use dtm_proto::{PacketClass, TransferFlag};

use super::DtmSession;
use crate::{
    action::SessionAction,
    env::Environment,
    error::SessionError,
    event::{SessionEvent, SessionObserver},
    payloads::{TransferRequest, from_cbor, to_cbor},
};

/// Transfers this session knows about, by id.
#[derive(Debug, Default)]
pub(super) struct Transfers {
    /// Offered by us, waiting for the peer's answer
    offered: BTreeSet<u64>,
    /// Offered by the peer and accepted here
    accepted: BTreeSet<u64>,
}

impl Transfers {
    pub(super) fn clear(&mut self) {
        self.offered.clear();
        self.accepted.clear();
    }
}

impl<E: Environment> DtmSession<E> {
    /// Offer a file the driver serves on `port`.
    ///
    /// The returned request carries a fresh key for the transfer cipher; the
    /// driver encrypts the file with it.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if the session is not established or
    ///   file transfer is disabled
    pub fn offer_file(
        &mut self,
        file_name: &str,
        size: u64,
        port: u16,
        observer: &mut dyn SessionObserver,
    ) -> Result<(TransferRequest, Vec<SessionAction>), SessionError> {
        self.ensure_transfers("offer a file")?;
        let session = self.parameters.primary_session;
        let request = TransferRequest {
            id: self.env.random_u64(),
            file_name: file_name.to_string(),
            size,
            port,
            session,
            key: KeyMaterial::generate(&session, |buf| self.env.random_bytes(buf)),
        };

        self.send_transfer(TransferFlag::Request, request.id, &to_cbor(&request)?, observer)?;
        self.transfers.offered.insert(request.id);
        tracing::info!(id = request.id, size, port, "file offered");
        Ok((request, self.take_actions()))
    }

    /// The driver finished writing an accepted file.
    pub fn complete_transfer(
        &mut self,
        id: u64,
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.ensure_established("complete a transfer")?;
        if !self.transfers.accepted.remove(&id) {
            return Err(SessionError::InvalidState {
                state: format!("no accepted transfer {id}"),
                operation: "complete a transfer",
            });
        }
        self.send_transfer(TransferFlag::Received, id, &[], observer)?;
        observer.on_event(&SessionEvent::FileReceived { id });
        Ok(self.take_actions())
    }

    /// Give up on a transfer in either direction and tell the peer.
    pub fn abandon_transfer(
        &mut self,
        id: u64,
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let known = self.transfers.accepted.remove(&id) | self.transfers.offered.remove(&id);
        if known && self.is_established() {
            tracing::info!(id, "transfer abandoned");
            self.send_transfer(TransferFlag::Refused, id, &[], observer)?;
        }
        Ok(self.take_actions())
    }

    /// Forward the driver's progress for a transfer to the observer.
    pub fn report_progress(&mut self, id: u64, percent: u8, observer: &mut dyn SessionObserver) {
        observer.on_event(&SessionEvent::FileProgress { id, percent: percent.min(100) });
    }

    pub(super) fn on_transfer(
        &mut self,
        flag: u16,
        option: i64,
        payload: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let Some(kind) = TransferFlag::from_u16(flag) else {
            return Err(self.unexpected(PacketClass::Transfer, flag));
        };
        let plain = self.open_sealed(PacketClass::Transfer, flag, payload)?;
        let id = option as u64;

        match kind {
            TransferFlag::Request => {
                let request: TransferRequest = from_cbor(&plain)?;
                request.session.validate()?;
                request.key.check(&request.session)?;
                self.on_file_offer(request, observer)?;
            },
            TransferFlag::Refused => {
                if self.transfers.offered.remove(&id) {
                    tracing::info!(id, "peer refused file");
                    observer.on_event(&SessionEvent::FileRefused { id });
                    self.actions.push(SessionAction::AbortTransfer { id });
                } else if self.transfers.accepted.remove(&id) {
                    tracing::info!(id, "sender abandoned file");
                    self.actions.push(SessionAction::AbortTransfer { id });
                }
            },
            TransferFlag::Received => {
                if self.transfers.offered.remove(&id) {
                    observer.on_event(&SessionEvent::FileSent { id });
                    self.actions.push(SessionAction::FinishTransfer { id });
                } else {
                    tracing::debug!(id, "receipt for unknown transfer");
                }
            },
        }
        Ok(())
    }

    fn on_file_offer(
        &mut self,
        request: TransferRequest,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let id = request.id;
        if !self.caps.file_transfer {
            tracing::debug!(id, "file offered while transfers are disabled");
            return self.send_transfer(TransferFlag::Refused, id, &[], observer);
        }

        let reply = observer.on_event(&SessionEvent::FileRequest { request: request.clone() });
        match reply.destination {
            Some(destination) if !reply.cancel => {
                tracing::info!(id, size = request.size, "file accepted");
                self.transfers.accepted.insert(id);
                self.actions.push(SessionAction::ReceiveFile { request, destination });
                Ok(())
            },
            _ => {
                tracing::info!(id, "file declined");
                self.send_transfer(TransferFlag::Refused, id, &[], observer)
            },
        }
    }

    fn ensure_transfers(&self, operation: &'static str) -> Result<(), SessionError> {
        self.ensure_established(operation)?;
        if self.caps.file_transfer {
            Ok(())
        } else {
            Err(SessionError::InvalidState { state: "file transfer disabled".to_string(), operation })
        }
    }

    fn send_transfer(
        &mut self,
        flag: TransferFlag,
        id: u64,
        plain: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        self.send_sealed(PacketClass::Transfer, flag.to_u16(), id as i64, plain, Duration::ZERO, observer)?;
        Ok(())
    }
}
