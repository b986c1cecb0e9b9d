//! Packet classes, per-class sub-type flags and terminate reasons.
//!
//! The header carries a one-byte class and a 16-bit sub-type flag whose meaning
//! depends on the class. Unknown flag values decode to `None`; the receive
//! path decides whether that is worth a retransmission request.

/// Top-level packet class, the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketClass {
    /// Handshake traffic; the flag is a [`Phase`]
    Exchange = 1,
    /// Encrypted application messages
    Message = 2,
    /// Reliability and liveness control
    Service = 3,
    /// File-transfer orchestration
    Transfer = 4,
    /// Forward-secrecy key forwarding
    Forwarding = 5,
}

impl PacketClass {
    /// Decode a class byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Exchange),
            2 => Some(Self::Message),
            3 => Some(Self::Service),
            4 => Some(Self::Transfer),
            5 => Some(Self::Forwarding),
            _ => None,
        }
    }

    /// Wire representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

macro_rules! sub_type {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Decode a sub-type flag.
            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $( $value => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Wire representation.
            pub fn to_u16(self) -> u16 {
                self as u16
            }
        }
    };
}

sub_type! {
    /// Handshake phase, carried as the flag of Exchange packets.
    ///
    /// # Invariants
    ///
    /// The declaration order is the protocol order. A session only ever moves
    /// to [`Phase::next`] of the phase it last completed.
    Phase {
        /// Partial identity and required classification
        Connect = 1,
        /// Full pre-auth identity
        Init = 2,
        /// Auth-phase asymmetric public key
        PreAuth = 3,
        /// Auth-phase symmetric key under the peer's auth public key
        AuthEx = 4,
        /// Secret id under the auth symmetric key
        Auth = 5,
        /// Primary-phase identity under the auth symmetric key
        Sync = 6,
        /// Primary-phase asymmetric public key
        PrimeEx = 7,
        /// Primary-phase symmetric key, double wrapped
        Primary = 8,
        /// Empty completion marker
        Established = 9,
    }
}

impl Phase {
    /// Every phase in protocol order.
    pub const ALL: [Self; 9] = [
        Self::Connect,
        Self::Init,
        Self::PreAuth,
        Self::AuthEx,
        Self::Auth,
        Self::Sync,
        Self::PrimeEx,
        Self::Primary,
        Self::Established,
    ];

    /// The phase that follows this one, `None` after `Established`.
    pub fn next(self) -> Option<Self> {
        Self::from_u16(self.to_u16() + 1)
    }
}

sub_type! {
    /// Message class sub-types.
    MessageFlag {
        /// Buffered, retransmit-protected message
        Transmission = 1,
        /// Unbuffered message that expects exactly one reply
        Request = 2,
    }
}

sub_type! {
    /// Service class sub-types.
    ServiceFlag {
        /// Liveness pulse
        KeepAlive = 1,
        /// Acknowledgment; option carries the acknowledged sequence
        Echo = 2,
        /// Retransmission request; option carries the missing sequence
        Resend = 3,
        /// Sender cannot recover a gap and asks for a resync
        DataLost = 4,
        /// Keystream realignment; option carries the outbound byte count
        Resync = 5,
        /// Teardown notice; option carries a [`TerminateReason`]
        Terminate = 6,
        /// Generic refusal notice
        Refusal = 7,
    }
}

sub_type! {
    /// Transfer class sub-types.
    TransferFlag {
        /// Offer of a file on an ephemeral port
        Request = 1,
        /// Offer declined; option carries the transfer id
        Refused = 2,
        /// Transfer complete; option carries the transfer id
        Received = 3,
    }
}

sub_type! {
    /// Forwarding class sub-types.
    ForwardingFlag {
        /// Ask the peer for a forward record
        KeyRequest = 1,
        /// Responder's forward record
        KeyResponse = 2,
        /// Requester's mirrored forward record
        KeyReturn = 3,
        /// Both records are in place
        KeySynchronized = 4,
        /// Forwarding declined or cancelled
        KeyRefused = 5,
    }
}

/// Reason code carried in the option field of Service/Terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminateReason {
    /// Orderly shutdown
    Normal,
    /// The application cancelled
    Vetoed,
    /// Liveness or handshake timeout
    Timeout,
    /// Unrecoverable loss
    DataLoss,
    /// Keystreams could not be realigned
    ResyncFailed,
    /// Malformed or unexpected traffic
    ProtocolError,
    /// Key or decryption failure
    CryptoError,
    /// Ratchet cancelled after the responder already switched keys
    ForwardRefused,
    /// Code not known to this version
    Unknown(i64),
}

impl TerminateReason {
    /// Decode from the option field.
    pub fn from_i64(code: i64) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::Vetoed,
            2 => Self::Timeout,
            3 => Self::DataLoss,
            4 => Self::ResyncFailed,
            5 => Self::ProtocolError,
            6 => Self::CryptoError,
            7 => Self::ForwardRefused,
            other => Self::Unknown(other),
        }
    }

    /// Encode for the option field.
    pub fn to_i64(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::Vetoed => 1,
            Self::Timeout => 2,
            Self::DataLoss => 3,
            Self::ResyncFailed => 4,
            Self::ProtocolError => 5,
            Self::CryptoError => 6,
            Self::ForwardRefused => 7,
            Self::Unknown(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_declaration_order() {
        for pair in Phase::ALL.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Phase::Established.next(), None);
        assert_eq!(Phase::from_u16(1), Some(Phase::Connect));
        assert_eq!(Phase::ALL.len(), 9);
    }

    #[test]
    fn unknown_values_do_not_decode() {
        assert_eq!(PacketClass::from_u8(0), None);
        assert_eq!(PacketClass::from_u8(6), None);
        assert_eq!(Phase::from_u16(0), None);
        assert_eq!(ServiceFlag::from_u16(8), None);
        assert_eq!(ForwardingFlag::from_u16(u16::MAX), None);
    }

    #[test]
    fn terminate_reason_preserves_unknown_codes() {
        for code in [0, 3, 7, 42, -1] {
            assert_eq!(TerminateReason::from_i64(code).to_i64(), code);
        }
        assert_eq!(TerminateReason::from_i64(42), TerminateReason::Unknown(42));
    }
}
