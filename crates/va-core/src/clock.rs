//! Time sources for lazily evaluated quantities.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of the current time in seconds.
pub trait Clock: Send + Sync {
    /// Returns the current time in seconds from an arbitrary fixed origin.
    fn now(&self) -> f64;
}

/// Monotonic wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock starting at `t0` seconds.
    pub fn starting_at(t0: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(t0.to_bits())),
        }
    }

    /// Sets the absolute time.
    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::SeqCst);
    }

    /// Advances the time by `dt` seconds.
    pub fn advance(&self, dt: f64) {
        let now = self.now();
        self.set(now + dt);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
