//! Parameter sets and their registry.
//!
//! A parameter set names the asymmetric and symmetric algorithms for the auth
//! and primary phases plus the padding and delay budgets used against traffic
//! analysis. Peers exchange only the 16-byte [`ParameterId`]; both sides must
//! resolve it through the same [`ParameterRegistry`].
//!
//! # Identifier layout
//!
//! ```text
//! [0..4]  auth asymmetric id (u32 BE)
//! [4..8]  primary asymmetric id (u32 BE)
//! [8]     auth symmetric cipher id      [9]  auth KDF digest id
//! [10]    primary symmetric cipher id   [11] primary KDF digest id
//! [12]    security classification       [13] sub-variant
//! [14]    padding engine id             [15] reserved (zero)
//! ```

use std::{fmt, time::Duration};

use dtm_crypto::{
    AsymmetricAlgorithm, KdfDigest, SymmetricSession,
    SymmetricCipherKind::{ChaCha8, ChaCha12, ChaCha20, XChaCha20},
};

use crate::env::Environment;

/// Security classification, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecurityClassification {
    /// Maximum security
    X1,
    /// High security
    X2,
    /// Balanced
    X3,
    /// Speed optimized
    X4,
}

impl SecurityClassification {
    /// Wire code.
    pub const fn code(self) -> u8 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X3 => 3,
            Self::X4 => 4,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::X1),
            2 => Some(Self::X2),
            3 => Some(Self::X3),
            4 => Some(Self::X4),
            _ => None,
        }
    }
}

/// 16-byte parameter-set identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterId(pub [u8; 16]);

impl ParameterId {
    /// Identifier carrying only a classification, sent at Connect before any
    /// algorithm choice is disclosed.
    pub const fn classification_only(classification: SecurityClassification) -> Self {
        let mut bytes = [0u8; 16];
        bytes[12] = classification.code();
        Self(bytes)
    }

    /// Auth-phase asymmetric algorithm id.
    pub fn auth_asymmetric_id(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Primary-phase asymmetric algorithm id.
    pub fn primary_asymmetric_id(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    /// Classification byte, decoded.
    pub fn classification(&self) -> Option<SecurityClassification> {
        SecurityClassification::from_code(self.0[12])
    }

    /// Sub-variant within the classification.
    pub fn variant(&self) -> u8 {
        self.0[13]
    }

    /// Padding engine, decoded.
    pub fn padding_engine(&self) -> Option<PaddingEngine> {
        PaddingEngine::from_id(self.0[14])
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParameterId({self})")
    }
}

/// Inclusive byte-count range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    /// Lower bound
    pub min: usize,
    /// Upper bound
    pub max: usize,
}

impl SizeRange {
    /// A range.
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Draw a length.
    pub fn sample<E: Environment>(&self, env: &E) -> usize {
        env.random_range(self.min as u64, self.max as u64) as usize
    }
}

/// Filler budgets placed before and after the real content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingProfile {
    /// Filler before the content
    pub prepend: SizeRange,
    /// Filler after the content
    pub append: SizeRange,
}

impl PaddingProfile {
    /// No filler at all; the markers are still written.
    pub const NONE: Self = Self { prepend: SizeRange::new(0, 0), append: SizeRange::new(0, 0) };

    /// Same range on both sides.
    pub const fn symmetric(min: usize, max: usize) -> Self {
        Self { prepend: SizeRange::new(min, max), append: SizeRange::new(min, max) }
    }
}

/// Random engine that draws padding lengths and filler bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaddingEngine {
    /// The session's [`Environment`]: OS randomness behind a driver, a seeded
    /// ChaCha stream under test
    Environment,
}

impl PaddingEngine {
    /// Identifier byte.
    pub const fn id(self) -> u8 {
        match self {
            Self::Environment => 1,
        }
    }

    /// Decode an identifier byte.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Environment),
            _ => None,
        }
    }
}

/// Millisecond delay range applied before a padded transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    /// Lower bound in milliseconds
    pub min_ms: u64,
    /// Upper bound in milliseconds
    pub max_ms: u64,
}

impl DelayRange {
    /// No delay.
    pub const NONE: Self = Self { min_ms: 0, max_ms: 0 };

    /// Range with only a maximum given: the minimum is half of it.
    pub const fn up_to(max_ms: u64) -> Self {
        Self { min_ms: max_ms / 2, max_ms }
    }

    /// Draw a delay.
    pub fn sample<E: Environment>(&self, env: &E) -> Duration {
        Duration::from_millis(env.random_range(self.min_ms, self.max_ms))
    }
}

/// An immutable named parameter bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmParameters {
    /// Registry name
    pub name: &'static str,
    /// Security classification
    pub classification: SecurityClassification,
    /// Sub-variant within the classification
    pub variant: u8,
    /// Auth-phase key encapsulation
    pub auth_asymmetric: AsymmetricAlgorithm,
    /// Primary-phase key encapsulation
    pub primary_asymmetric: AsymmetricAlgorithm,
    /// Auth-phase symmetric session
    pub auth_session: SymmetricSession,
    /// Primary-phase symmetric session
    pub primary_session: SymmetricSession,
    /// Filler around the primary public key (PrimeEx)
    pub primary_key_padding: PaddingProfile,
    /// Filler around the primary key exchange (Primary)
    pub exchange_padding: PaddingProfile,
    /// Filler around identity payloads and post-handshake messages
    pub message_padding: PaddingProfile,
    /// Delay before sending the primary public key
    pub primary_key_delay: DelayRange,
    /// Delay before sending the primary key exchange
    pub exchange_delay: DelayRange,
    /// Delay before sending messages
    pub message_delay: DelayRange,
    /// Source of padding randomness
    pub padding_engine: PaddingEngine,
}

impl DtmParameters {
    /// The 16-byte identifier for this bundle.
    pub const fn id(&self) -> ParameterId {
        let mut bytes = [0u8; 16];
        let auth = self.auth_asymmetric.id().to_be_bytes();
        let primary = self.primary_asymmetric.id().to_be_bytes();
        bytes[0] = auth[0];
        bytes[1] = auth[1];
        bytes[2] = auth[2];
        bytes[3] = auth[3];
        bytes[4] = primary[0];
        bytes[5] = primary[1];
        bytes[6] = primary[2];
        bytes[7] = primary[3];
        bytes[8] = self.auth_session.cipher.id();
        bytes[9] = kdf_id(self.auth_session.kdf);
        bytes[10] = self.primary_session.cipher.id();
        bytes[11] = kdf_id(self.primary_session.kdf);
        bytes[12] = self.classification.code();
        bytes[13] = self.variant;
        bytes[14] = self.padding_engine.id();
        ParameterId(bytes)
    }
}

const fn kdf_id(kdf: Option<KdfDigest>) -> u8 {
    match kdf {
        Some(digest) => digest.id(),
        None => 0,
    }
}

static BUNDLES: [DtmParameters; 8] = [
    DtmParameters {
        name: "X1.1",
        classification: SecurityClassification::X1,
        variant: 1,
        auth_asymmetric: AsymmetricAlgorithm::MlKem1024,
        primary_asymmetric: AsymmetricAlgorithm::MlKem1024,
        auth_session: SymmetricSession::derived(XChaCha20, 64, 32, KdfDigest::Sha512),
        primary_session: SymmetricSession::derived(XChaCha20, 64, 32, KdfDigest::Sha512),
        primary_key_padding: PaddingProfile::symmetric(64, 256),
        exchange_padding: PaddingProfile::symmetric(32, 128),
        message_padding: PaddingProfile::symmetric(16, 64),
        primary_key_delay: DelayRange::up_to(30),
        exchange_delay: DelayRange::up_to(30),
        message_delay: DelayRange::up_to(10),
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X1.2",
        classification: SecurityClassification::X1,
        variant: 2,
        auth_asymmetric: AsymmetricAlgorithm::MlKem768,
        primary_asymmetric: AsymmetricAlgorithm::MlKem1024,
        auth_session: SymmetricSession::derived(ChaCha20, 64, 32, KdfDigest::Sha512),
        primary_session: SymmetricSession::derived(XChaCha20, 64, 32, KdfDigest::Sha512),
        primary_key_padding: PaddingProfile::symmetric(64, 256),
        exchange_padding: PaddingProfile::symmetric(32, 128),
        message_padding: PaddingProfile::symmetric(16, 64),
        primary_key_delay: DelayRange::up_to(20),
        exchange_delay: DelayRange::up_to(20),
        message_delay: DelayRange::up_to(10),
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X2.1",
        classification: SecurityClassification::X2,
        variant: 1,
        auth_asymmetric: AsymmetricAlgorithm::MlKem768,
        primary_asymmetric: AsymmetricAlgorithm::MlKem1024,
        auth_session: SymmetricSession::native(XChaCha20),
        primary_session: SymmetricSession::derived(XChaCha20, 48, 24, KdfDigest::Sha256),
        primary_key_padding: PaddingProfile::symmetric(32, 128),
        exchange_padding: PaddingProfile::symmetric(16, 64),
        message_padding: PaddingProfile::symmetric(8, 32),
        primary_key_delay: DelayRange::up_to(10),
        exchange_delay: DelayRange::up_to(10),
        message_delay: DelayRange::up_to(5),
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X2.2",
        classification: SecurityClassification::X2,
        variant: 2,
        auth_asymmetric: AsymmetricAlgorithm::MlKem768,
        primary_asymmetric: AsymmetricAlgorithm::MlKem768,
        auth_session: SymmetricSession::native(ChaCha20),
        primary_session: SymmetricSession::derived(ChaCha20, 32, 16, KdfDigest::Sha256),
        primary_key_padding: PaddingProfile::symmetric(32, 128),
        exchange_padding: PaddingProfile::symmetric(16, 64),
        message_padding: PaddingProfile::symmetric(8, 32),
        primary_key_delay: DelayRange::up_to(10),
        exchange_delay: DelayRange::up_to(10),
        message_delay: DelayRange::NONE,
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X3.1",
        classification: SecurityClassification::X3,
        variant: 1,
        auth_asymmetric: AsymmetricAlgorithm::MlKem512,
        primary_asymmetric: AsymmetricAlgorithm::MlKem768,
        auth_session: SymmetricSession::native(ChaCha20),
        primary_session: SymmetricSession::native(XChaCha20),
        primary_key_padding: PaddingProfile::symmetric(0, 64),
        exchange_padding: PaddingProfile::symmetric(0, 32),
        message_padding: PaddingProfile::symmetric(0, 16),
        primary_key_delay: DelayRange::NONE,
        exchange_delay: DelayRange::NONE,
        message_delay: DelayRange::NONE,
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X3.2",
        classification: SecurityClassification::X3,
        variant: 2,
        auth_asymmetric: AsymmetricAlgorithm::MlKem512,
        primary_asymmetric: AsymmetricAlgorithm::MlKem768,
        auth_session: SymmetricSession::native(ChaCha12),
        primary_session: SymmetricSession::native(ChaCha20),
        primary_key_padding: PaddingProfile::symmetric(0, 64),
        exchange_padding: PaddingProfile::symmetric(0, 32),
        message_padding: PaddingProfile::symmetric(0, 16),
        primary_key_delay: DelayRange::NONE,
        exchange_delay: DelayRange::NONE,
        message_delay: DelayRange::NONE,
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X4.1",
        classification: SecurityClassification::X4,
        variant: 1,
        auth_asymmetric: AsymmetricAlgorithm::MlKem512,
        primary_asymmetric: AsymmetricAlgorithm::MlKem512,
        auth_session: SymmetricSession::native(ChaCha8),
        primary_session: SymmetricSession::native(ChaCha12),
        primary_key_padding: PaddingProfile::NONE,
        exchange_padding: PaddingProfile::NONE,
        message_padding: PaddingProfile::NONE,
        primary_key_delay: DelayRange::NONE,
        exchange_delay: DelayRange::NONE,
        message_delay: DelayRange::NONE,
        padding_engine: PaddingEngine::Environment,
    },
    DtmParameters {
        name: "X4.2",
        classification: SecurityClassification::X4,
        variant: 2,
        auth_asymmetric: AsymmetricAlgorithm::MlKem512,
        primary_asymmetric: AsymmetricAlgorithm::MlKem512,
        auth_session: SymmetricSession::native(ChaCha8),
        primary_session: SymmetricSession::native(ChaCha8),
        primary_key_padding: PaddingProfile::symmetric(0, 8),
        exchange_padding: PaddingProfile::symmetric(0, 8),
        message_padding: PaddingProfile::symmetric(0, 8),
        primary_key_delay: DelayRange::NONE,
        exchange_delay: DelayRange::NONE,
        message_delay: DelayRange::NONE,
        padding_engine: PaddingEngine::Environment,
    },
];

/// Lookup over the built-in parameter bundles.
pub struct ParameterRegistry;

impl ParameterRegistry {
    /// Every bundle, strongest classification first.
    pub fn all() -> &'static [DtmParameters] {
        &BUNDLES
    }

    /// Bundle by registry name.
    pub fn by_name(name: &str) -> Option<DtmParameters> {
        BUNDLES.iter().find(|p| p.name == name).copied()
    }

    /// Bundle whose identifier matches `id`.
    pub fn by_id(id: &ParameterId) -> Option<DtmParameters> {
        BUNDLES.iter().find(|p| p.id() == *id).copied()
    }

    /// Default bundle for a classification.
    pub fn for_classification(classification: SecurityClassification) -> Option<DtmParameters> {
        BUNDLES.iter().find(|p| p.classification == classification).copied()
    }
}
