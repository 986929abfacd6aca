//! Deterministic Gaussian noise for PV fluctuations.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Gaussian noise generator over a seeded `StdRng`.
///
/// Every PV draws from its own substream so that adding or removing a
/// fluctuating PV does not shift the noise seen by the others. Substream seeds
/// hash `(master_seed, pv_name)` with SipHash-1-3 and zero keys.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    /// Creates a generator from a seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Creates the generator dedicated to `pv_name`.
    pub fn for_pv(master_seed: u64, pv_name: &str) -> Self {
        Self::from_seed(derive_pv_seed(master_seed, pv_name))
    }

    /// Draws one sample from the standard normal distribution.
    pub fn standard_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    /// Draws `sigma · N(0, 1)`.
    pub fn gaussian(&mut self, sigma: f64) -> f64 {
        sigma * self.standard_normal()
    }
}

/// Derives the deterministic seed used for a PV's noise substream.
pub fn derive_pv_seed(master_seed: u64, pv_name: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write(pv_name.as_bytes());
    hasher.finish()
}
