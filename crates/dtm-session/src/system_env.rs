//! Production environment backed by the OS RNG.

use dtm_core::Environment;

/// Production environment using getrandom for all randomness.
///
/// # Security
///
/// Key material, transfer ids and padding all draw from here, so this must be
/// cryptographically secure. getrandom reads the OS CSPRNG (`getrandom(2)` on
/// Linux, `BCryptGenRandom` on Windows).
///
/// # Panics
///
/// Panics if the OS RNG fails. A session without working randomness would
/// produce predictable keys, so there is nothing sensible to continue with.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
