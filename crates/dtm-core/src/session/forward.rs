//! Forward-secrecy key exchange over an established channel.
//!
//! ```text
//! Requester                           Responder
//!   KeyRequest(instruction)    ───►
//!                              ◄───   KeyResponse(responder record)
//!   KeyReturn(requester record) ───►
//!                              ◄───   KeySynchronized          [ratchet: switch keys]
//!   [ratchet: switch keys, flush held sends]
//! ```
//!
//! Either side may answer with KeyRefused at any step, which resets both
//! ends to idle. All payloads travel sealed under the current channel keys.
//!
//! # Invariants
//!
//! - At most one exchange is in flight per session.
//! - The requester holds every sealed send (messages, transfer control,
//!   forwarding replies and Resync) between sending KeyReturn and receiving
//!   KeySynchronized on a ratchet, so nothing is sealed under keys the peer
//!   has already discarded. Unsealed service packets go out immediately.

use std::{mem, time::Duration};

use dtm_crypto::KeyMaterial;
use dtm_proto::{ForwardingFlag, PacketClass, TerminateReason};

use super::{DtmSession, State};
use crate::{
    action::SessionAction,
    channel::ChannelKeys,
    env::Environment,
    error::SessionError,
    event::{SessionEvent, SessionObserver},
    payloads::{ForwardRecord, KeyInstruction, KeyRequestPayload, from_cbor, to_cbor},
};

#[derive(Debug, Default)]
pub(super) enum Forwarding {
    #[default]
    Idle,
    /// Requester sent KeyRequest
    Requested { instruction: KeyInstruction },
    /// Responder sent its record
    Responded { forward: ForwardRecord },
    /// Requester holds both records and waits for KeySynchronized
    Returned { forward: ForwardRecord, returned: ForwardRecord },
}

impl Forwarding {
    pub(super) fn holds_sends(&self) -> bool {
        matches!(self, Self::Returned { forward, .. } if forward.instruction == KeyInstruction::Ratchet)
    }

    pub(super) fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub(super) fn reset(&mut self) {
        *self = Self::Idle;
    }
}

impl<E: Environment> DtmSession<E> {
    /// Start a forwarding exchange.
    ///
    /// With [`KeyInstruction::Ratchet`] both sides replace their channel keys
    /// with the exchanged records once the exchange completes.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if the session is not established,
    ///   forwarding is disabled, or an exchange is already in progress
    pub fn request_key(
        &mut self,
        instruction: KeyInstruction,
        observer: &mut dyn SessionObserver,
    ) -> Result<Vec<SessionAction>, SessionError> {
        const OPERATION: &str = "request a forward key";
        self.ensure_established(OPERATION)?;
        if !self.caps.key_forwarding {
            return Err(SessionError::InvalidState {
                state: "key forwarding disabled".to_string(),
                operation: OPERATION,
            });
        }
        if !self.forwarding.is_idle() {
            return Err(SessionError::InvalidState {
                state: "a forwarding exchange is in progress".to_string(),
                operation: OPERATION,
            });
        }

        let payload = to_cbor(&KeyRequestPayload { instruction })?;
        self.send_forwarding(ForwardingFlag::KeyRequest, instruction, &payload, observer)?;
        self.forwarding = Forwarding::Requested { instruction };
        tracing::info!(?instruction, "forward key requested");
        Ok(self.take_actions())
    }

    pub(super) fn on_forwarding(
        &mut self,
        flag: u16,
        payload: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let Some(kind) = ForwardingFlag::from_u16(flag) else {
            return Err(self.unexpected(PacketClass::Forwarding, flag));
        };
        let plain = self.open_sealed(PacketClass::Forwarding, flag, payload)?;
        tracing::debug!(?kind, "forwarding packet");

        match kind {
            ForwardingFlag::KeyRequest => self.on_key_request(&plain, observer),
            ForwardingFlag::KeyResponse => self.on_key_response(&plain, observer),
            ForwardingFlag::KeyReturn => self.on_key_return(&plain, observer),
            ForwardingFlag::KeySynchronized => self.on_key_synchronized(observer),
            ForwardingFlag::KeyRefused => {
                self.forwarding.reset();
                self.flush_held(observer)?;
                self.raise(SessionError::Refused("peer refused key forwarding".to_string()), observer);
                Ok(())
            },
        }
    }

    fn on_key_request(
        &mut self,
        plain: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let KeyRequestPayload { instruction } = from_cbor(plain)?;

        if !self.caps.key_forwarding {
            self.refuse_forwarding(instruction, observer)?;
            self.raise(
                SessionError::Refused("peer requested key forwarding, which is disabled".to_string()),
                observer,
            );
            return Ok(());
        }
        if !self.forwarding.is_idle() {
            // Our own exchange stays in flight.
            tracing::debug!(?instruction, "key request while an exchange is in progress");
            return self.send_forwarding(ForwardingFlag::KeyRefused, instruction, &[], observer);
        }

        let reply = observer.on_event(&SessionEvent::KeyRequested { instruction });
        if reply.cancel {
            tracing::info!(?instruction, "key request declined by application");
            return self.refuse_forwarding(instruction, observer);
        }

        let record = self.new_record(instruction, reply.key_lifetime, reply.key_option);
        self.send_forwarding(ForwardingFlag::KeyResponse, instruction, &to_cbor(&record)?, observer)?;
        self.forwarding = Forwarding::Responded { forward: record };
        Ok(())
    }

    fn on_key_response(
        &mut self,
        plain: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let Forwarding::Requested { instruction } = self.forwarding else {
            return Err(self.unexpected(PacketClass::Forwarding, ForwardingFlag::KeyResponse.to_u16()));
        };
        let returned: ForwardRecord = from_cbor(plain)?;
        check_record(&returned, instruction)?;

        let forward = self.new_record(instruction, returned.lifetime, returned.option);
        self.send_forwarding(ForwardingFlag::KeyReturn, instruction, &to_cbor(&forward)?, observer)?;
        self.forwarding = Forwarding::Returned { forward, returned };
        Ok(())
    }

    fn on_key_return(
        &mut self,
        plain: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        let forward = match mem::take(&mut self.forwarding) {
            Forwarding::Responded { forward } => forward,
            other => {
                self.forwarding = other;
                return Err(self.unexpected(PacketClass::Forwarding, ForwardingFlag::KeyReturn.to_u16()));
            },
        };
        let returned: ForwardRecord = from_cbor(plain)?;
        check_record(&returned, forward.instruction)?;

        let reply = observer.on_event(&SessionEvent::KeySynchronized {
            forward: forward.clone(),
            returned: returned.clone(),
        });
        if reply.cancel {
            return self.refuse_forwarding(forward.instruction, observer);
        }

        // Confirm under the old keys; the peer switches only after reading it.
        self.send_forwarding(ForwardingFlag::KeySynchronized, forward.instruction, &[], observer)?;
        if forward.instruction == KeyInstruction::Ratchet {
            self.ratchet(&forward, &returned)?;
        }
        Ok(())
    }

    fn on_key_synchronized(&mut self, observer: &mut dyn SessionObserver) -> Result<(), SessionError> {
        let (forward, returned) = match mem::take(&mut self.forwarding) {
            Forwarding::Returned { forward, returned } => (forward, returned),
            other => {
                self.forwarding = other;
                return Err(
                    self.unexpected(PacketClass::Forwarding, ForwardingFlag::KeySynchronized.to_u16())
                );
            },
        };

        let reply = observer.on_event(&SessionEvent::KeySynchronized {
            forward: forward.clone(),
            returned: returned.clone(),
        });
        match (reply.cancel, forward.instruction) {
            (true, KeyInstruction::Ratchet) => {
                // The peer already switched; there is no channel left to share.
                tracing::warn!("ratchet vetoed after the peer switched keys");
                self.shutdown(reply.reason.unwrap_or(TerminateReason::ForwardRefused), true, observer);
                return Ok(());
            },
            (true, KeyInstruction::Forward) => {
                self.refuse_forwarding(KeyInstruction::Forward, observer)?;
            },
            (false, KeyInstruction::Ratchet) => self.ratchet(&forward, &returned)?,
            (false, KeyInstruction::Forward) => {},
        }
        self.flush_held(observer)
    }

    fn ratchet(&mut self, forward: &ForwardRecord, returned: &ForwardRecord) -> Result<(), SessionError> {
        let State::Established(channel) = &mut self.state else {
            return Err(self.invalid_state("ratchet channel keys"));
        };
        channel.install(ChannelKeys::from_records(forward, returned))?;
        tracing::info!(cipher = ?forward.session.cipher, "channel keys ratcheted");
        Ok(())
    }

    fn refuse_forwarding(
        &mut self,
        instruction: KeyInstruction,
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        self.forwarding.reset();
        self.send_forwarding(ForwardingFlag::KeyRefused, instruction, &[], observer)
    }

    fn send_forwarding(
        &mut self,
        flag: ForwardingFlag,
        instruction: KeyInstruction,
        plain: &[u8],
        observer: &mut dyn SessionObserver,
    ) -> Result<(), SessionError> {
        self.send_sealed(
            PacketClass::Forwarding,
            flag.to_u16(),
            instruction.code(),
            plain,
            Duration::ZERO,
            observer,
        )?;
        Ok(())
    }

    fn new_record(&self, instruction: KeyInstruction, lifetime: u64, option: i64) -> ForwardRecord {
        let session = self.parameters.primary_session;
        ForwardRecord {
            key: KeyMaterial::generate(&session, |buf| self.env.random_bytes(buf)),
            session,
            lifetime,
            instruction,
            option,
        }
    }
}

fn check_record(record: &ForwardRecord, instruction: KeyInstruction) -> Result<(), SessionError> {
    if record.instruction != instruction {
        return Err(SessionError::UnexpectedPacket {
            state: format!("forwarding {instruction:?}, peer record says {:?}", record.instruction),
            class: PacketClass::Forwarding.to_u8(),
            flag: ForwardingFlag::KeyResponse.to_u16(),
        });
    }
    record.session.validate()?;
    record.key.check(&record.session)?;
    Ok(())
}
