//! Bunch-by-bunch charge accounting with lazy lifetime decay.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use va_core::{Clock, ErrorInfo, VaError};

/// Partial lifetimes driving the decay model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lifetimes {
    /// Elastic gas scattering lifetime [s].
    #[serde(default = "infinite")]
    pub elastic: f64,
    /// Inelastic gas scattering lifetime [s].
    #[serde(default = "infinite")]
    pub inelastic: f64,
    /// Quantum excitation lifetime [s]. Reported only, never decays charge.
    #[serde(default = "infinite")]
    pub quantum: f64,
    /// Touschek loss-rate coefficient [1/(C·s)].
    #[serde(default)]
    pub touschek_coefficient: f64,
}

fn infinite() -> f64 {
    f64::INFINITY
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            elastic: f64::INFINITY,
            inelastic: f64::INFINITY,
            quantum: f64::INFINITY,
            touschek_coefficient: 0.0,
        }
    }
}

impl Lifetimes {
    /// Single-particle lifetime, the harmonic sum of elastic and inelastic lifetimes.
    pub fn single_particle(&self) -> f64 {
        let rate = self.elastic.recip() + self.inelastic.recip();
        if rate == 0.0 {
            f64::INFINITY
        } else {
            rate.recip()
        }
    }

    /// Loss rate shared by every particle regardless of bunch charge [1/s].
    pub fn single_particle_loss_rate(&self) -> f64 {
        self.elastic.recip() + self.inelastic.recip() + self.quantum.recip()
    }
}

/// Partial update applied by [`ChargeLedger::set_lifetimes`]; `None` keeps the old value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LifetimeUpdate {
    /// New elastic lifetime [s].
    pub elastic: Option<f64>,
    /// New inelastic lifetime [s].
    pub inelastic: Option<f64>,
    /// New quantum lifetime [s].
    pub quantum: Option<f64>,
    /// New Touschek coefficient [1/(C·s)].
    pub touschek_coefficient: Option<f64>,
}

impl From<Lifetimes> for LifetimeUpdate {
    fn from(lifetimes: Lifetimes) -> Self {
        Self {
            elastic: Some(lifetimes.elastic),
            inelastic: Some(lifetimes.inelastic),
            quantum: Some(lifetimes.quantum),
            touschek_coefficient: Some(lifetimes.touschek_coefficient),
        }
    }
}

/// Serializable view of a ledger, used for status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Per-bunch charge [C].
    pub charges: Vec<f64>,
    /// Total charge [C].
    pub total_charge: f64,
    /// Charge-weighted total lifetime [s].
    pub total_lifetime: f64,
    /// Lifetime parameters in force.
    pub lifetimes: Lifetimes,
    /// Number of bunch updates discarded because they evaluated to NaN.
    pub nan_events: u64,
}

/// Per-bunch charge ledger.
///
/// Charges decay lazily: every read evaluates the decay model for the time
/// elapsed since the previous evaluation and moves the base time forward.
/// Two reads with no elapsed time return the same charges, but the base time
/// still advances, which feeds the accumulated-charge bookkeeping.
pub struct ChargeLedger {
    charges: Vec<f64>,
    lifetimes: Lifetimes,
    timestamp: f64,
    accumulated: f64,
    nan_events: u64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ChargeLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChargeLedger")
            .field("nr_bunches", &self.charges.len())
            .field("lifetimes", &self.lifetimes)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl ChargeLedger {
    /// Creates an empty ledger with `nr_bunches` slots.
    pub fn new(nr_bunches: usize, clock: Arc<dyn Clock>) -> Result<Self, VaError> {
        if nr_bunches == 0 {
            return Err(VaError::Config(
                ErrorInfo::new("zero-bunches", "a charge ledger needs at least one bunch")
                    .with_hint("set nr_bunches to the harmonic number or pulse length"),
            ));
        }
        let timestamp = clock.now();
        Ok(Self {
            charges: vec![0.0; nr_bunches],
            lifetimes: Lifetimes::default(),
            timestamp,
            accumulated: 0.0,
            nan_events: 0,
            clock,
        })
    }

    /// Spreads `total` uniformly over all bunches.
    pub fn with_initial_charge(mut self, total: f64) -> Self {
        let per_bunch = total / self.charges.len() as f64;
        self.charges.iter_mut().for_each(|q| *q = per_bunch.max(0.0));
        self
    }

    /// Replaces the lifetime parameters.
    pub fn with_lifetimes(mut self, lifetimes: Lifetimes) -> Self {
        self.lifetimes = lifetimes;
        self
    }

    /// Number of bunch slots, fixed at construction.
    pub fn nr_bunches(&self) -> usize {
        self.charges.len()
    }

    /// Lifetime parameters in force.
    pub fn lifetimes(&self) -> &Lifetimes {
        &self.lifetimes
    }

    /// Count of bunch updates discarded because they evaluated to NaN.
    pub fn nan_events(&self) -> u64 {
        self.nan_events
    }

    /// Up-to-date per-bunch charges [C].
    pub fn current_charges(&mut self) -> Vec<f64> {
        self.update();
        self.charges.clone()
    }

    /// Sum of [`Self::current_charges`].
    pub fn total_charge(&mut self) -> f64 {
        self.update();
        self.charges.iter().sum()
    }

    /// Adds `delta[i]` to bunch `i mod N`, after bringing the charges up to date.
    pub fn inject(&mut self, delta: &[f64]) {
        self.update();
        let nr_bunches = self.charges.len();
        for (i, dq) in delta.iter().enumerate() {
            let slot = &mut self.charges[i % nr_bunches];
            *slot = (*slot + dq).max(0.0);
        }
    }

    /// Returns the current charges and dumps the ledger.
    pub fn eject(&mut self) -> Vec<f64> {
        let ejected = self.current_charges();
        self.dump();
        ejected
    }

    /// Zeroes every bunch and resets the base time.
    pub fn dump(&mut self) {
        self.charges.iter_mut().for_each(|q| *q = 0.0);
        self.timestamp = self.clock.now();
    }

    /// Overwrites the supplied lifetime fields after decaying under the old ones.
    pub fn set_lifetimes(&mut self, update: LifetimeUpdate) {
        self.update();
        if let Some(value) = update.elastic {
            self.lifetimes.elastic = value;
        }
        if let Some(value) = update.inelastic {
            self.lifetimes.inelastic = value;
        }
        if let Some(value) = update.quantum {
            self.lifetimes.quantum = value;
        }
        if let Some(value) = update.touschek_coefficient {
            self.lifetimes.touschek_coefficient = value;
        }
    }

    /// Per-bunch loss rate `1/τel + 1/τinel + 1/τq + tc·q_i` [1/s].
    pub fn per_bunch_loss_rate(&mut self) -> Vec<f64> {
        self.update();
        let base = self.lifetimes.single_particle_loss_rate();
        let tc = self.lifetimes.touschek_coefficient;
        self.charges.iter().map(|q| base + tc * q).collect()
    }

    /// Per-bunch lifetime; infinite where the loss rate is exactly zero.
    pub fn per_bunch_lifetime(&mut self) -> Vec<f64> {
        self.per_bunch_loss_rate()
            .into_iter()
            .map(|rate| if rate == 0.0 { f64::INFINITY } else { rate.recip() })
            .collect()
    }

    /// Charge-weighted total lifetime.
    ///
    /// With zero total charge the plain average of the per-bunch rates is used.
    pub fn total_lifetime(&mut self) -> f64 {
        let rates = self.per_bunch_loss_rate();
        let total: f64 = self.charges.iter().sum();
        let average = if total != 0.0 {
            let weighted: f64 = rates
                .iter()
                .zip(&self.charges)
                .filter(|(_, q)| **q != 0.0)
                .map(|(rate, q)| rate * q)
                .sum();
            weighted / total
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };
        if average != 0.0 {
            average.recip()
        } else {
            f64::INFINITY
        }
    }

    /// Touschek-only lifetime of the whole beam.
    pub fn touschek_lifetime(&mut self) -> f64 {
        let rate = self.lifetimes.touschek_coefficient * self.total_charge();
        if rate > 0.0 {
            rate.recip()
        } else {
            f64::INFINITY
        }
    }

    /// Per-bunch currents for a revolution period [A].
    pub fn currents(&mut self, period: f64) -> Vec<f64> {
        self.current_charges().into_iter().map(|q| q / period).collect()
    }

    /// Total current for a revolution period [A].
    pub fn total_current(&mut self, period: f64) -> f64 {
        self.total_charge() / period
    }

    /// Accumulated `|Δcharge|·Δt` bookkeeping divided by `interval`.
    pub fn accumulated_charge(&mut self, interval: f64) -> f64 {
        self.update();
        self.accumulated / interval
    }

    /// Serializable view of the ledger.
    pub fn snapshot(&mut self) -> LedgerSnapshot {
        let total_lifetime = self.total_lifetime();
        LedgerSnapshot {
            charges: self.charges.clone(),
            total_charge: self.charges.iter().sum(),
            total_lifetime,
            lifetimes: self.lifetimes,
            nan_events: self.nan_events,
        }
    }

    fn update(&mut self) {
        let now = self.clock.now();
        let dt = now - self.timestamp;
        let tau = self.lifetimes.single_particle();
        let decay = (-dt / tau).exp();
        let tc = self.lifetimes.touschek_coefficient;

        let previous_total: f64 = self.charges.iter().sum();
        let mut discarded = 0u64;
        for q in self.charges.iter_mut() {
            let touschek = if tau.is_infinite() {
                tc * dt * *q
            } else {
                tc * tau * (1.0 - decay) * *q
            };
            let next = decay * *q / (1.0 + touschek);
            if next.is_nan() {
                discarded += 1;
                continue;
            }
            *q = next;
        }
        if discarded > 0 {
            self.nan_events += discarded;
            warn!(
                discarded,
                nan_events = self.nan_events,
                dt,
                "bunch charge update evaluated to NaN, previous charge kept"
            );
        }

        let total: f64 = self.charges.iter().sum();
        self.accumulated += (total - previous_total).abs() * dt;
        self.timestamp = now;
    }
}

/// Touschek coefficient equivalent to a lifetime quoted at a reference bunch current.
///
/// `tc = 1 / (τref · Iref · T0)`; an infinite reference lifetime gives zero.
pub fn touschek_coefficient_from_reference(
    reference_lifetime: f64,
    reference_current: f64,
    period: f64,
) -> f64 {
    if reference_lifetime.is_infinite() {
        return 0.0;
    }
    (reference_lifetime * reference_current * period).recip()
}
