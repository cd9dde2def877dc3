//! Random-byte source for the conversation.
//!
//! Every conversation draws its ephemeral keys, AKE nonces, and SMP
//! exponents from an injected [`Rng`] so that tests can run the whole
//! protocol deterministically from a fixed seed. The production source is
//! ChaCha20 seeded from the operating system.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::OtrError;

/// Cryptographically secure random source backing a conversation.
pub struct Rng {
    inner: ChaCha20Rng,
}

impl Default for Rng {
    fn default() -> Self {
        Self {
            inner: ChaCha20Rng::from_entropy(),
        }
    }
}

impl Rng {
    /// Create a deterministic source from a fixed seed.
    ///
    /// Two conversations driven from identical seeds produce identical
    /// wire traffic, which is what the protocol tests rely on.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            inner: ChaCha20Rng::from_seed(seed),
        }
    }

    /// Fill `out` with random bytes.
    pub fn fill(&mut self, out: &mut [u8]) -> Result<(), OtrError> {
        self.inner
            .try_fill_bytes(out)
            .map_err(|_| OtrError::ShortRandomRead)
    }

    /// Draw a fixed-size array of random bytes.
    pub fn random_array<const N: usize>(&mut self) -> Result<[u8; N], OtrError> {
        let mut out = [0u8; N];
        self.fill(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let mut a = Rng::from_seed([7; 32]);
        let mut b = Rng::from_seed([7; 32]);
        assert_eq!(
            a.random_array::<32>().unwrap(),
            b.random_array::<32>().unwrap()
        );
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = Rng::from_seed([1; 32]);
        let mut b = Rng::from_seed([2; 32]);
        assert_ne!(
            a.random_array::<32>().unwrap(),
            b.random_array::<32>().unwrap()
        );
    }
}
