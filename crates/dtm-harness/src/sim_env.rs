//! Seeded environment for reproducible sessions.

use std::sync::{Arc, Mutex};

use dtm_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Deterministic environment backed by a seeded ChaCha20 stream.
///
/// Clones share one stream, so a session and its handshake draw from the same
/// sequence. Two peers should use [`SimEnv::fork`] to get independent streams
/// from one seed.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed, rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }

    /// Independent stream `stream` of the same seed.
    #[must_use]
    pub fn fork(&self, stream: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        Self { seed: self.seed, rng: Arc::new(Mutex::new(rng)) }
    }

    /// Seed this environment was built from.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("seed", &self.seed).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        match self.rng.lock() {
            Ok(mut rng) => rng.fill_bytes(buffer),
            Err(poisoned) => poisoned.into_inner().fill_bytes(buffer),
        }
    }
}
