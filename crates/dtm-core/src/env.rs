//! Environment abstraction for deterministic testing.
//!
//! The engine never touches the OS directly. Randomness for key material,
//! padding and delays comes through [`Environment`], so a seeded
//! implementation makes a whole handshake reproducible.

/// Source of randomness for the protocol engine.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Given the same seed, a simulation produces the same byte sequence
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Uniform value in `min..=max`. Returns `min` when the range is empty.
    fn random_range(&self, min: u64, max: u64) -> u64 {
        if max <= min {
            return min;
        }
        match (max - min).checked_add(1) {
            Some(span) => min + self.random_u64() % span,
            None => self.random_u64(),
        }
    }
}
