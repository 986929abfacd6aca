//! Values exchanged between stages: injection cycles, physics parameters and outcomes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use va_optics::EfficiencyParameters;

/// Charge travelling from one stage to the next.
///
/// Ownership moves with the message; a stage never keeps a handle on a
/// cycle it has forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionCycle {
    /// Charge per bunch [C]. Empty asks the linac to fire its electron gun.
    pub charge: Vec<f64>,
    /// Arrival time of every bunch [s].
    pub charge_time: Vec<f64>,
    /// Delay of the timing master for this cycle [s].
    pub master_delay: f64,
    /// Time between linac bunches [s].
    pub bunch_separation: f64,
    /// Storage-ring bucket targeted by the cycle.
    pub injection_bunch: usize,
    /// Extraction efficiency of the previous ring, applied by the next transport line.
    #[serde(default)]
    pub ejection_efficiency: Option<f64>,
}

impl InjectionCycle {
    /// Cycle for an electron-gun shot at `injection_bunch`.
    pub fn shot(injection_bunch: usize, bunch_separation: f64) -> Self {
        Self {
            charge: Vec::new(),
            charge_time: Vec::new(),
            master_delay: injection_bunch as f64 * bunch_separation,
            bunch_separation,
            injection_bunch,
            ejection_efficiency: None,
        }
    }

    /// Replaces the gun output with an explicit charge vector.
    pub fn with_charge(mut self, charge: Vec<f64>) -> Self {
        self.charge = charge;
        self
    }

    /// Total charge [C].
    pub fn total_charge(&self) -> f64 {
        self.charge.iter().sum()
    }
}

/// Physics information pushed from a stage to its downstream neighbour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PhysicsParameters {
    /// Beam leaving the stage, for the neighbour's efficiency model.
    Injection(EfficiencyParameters),
    /// Pulsed-magnet delays keyed by family [s].
    UpdateDelays(BTreeMap<String, f64>),
    /// The beam last published by the stage is no longer valid.
    Withdrawn,
}

/// One efficiency factor applied during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStep {
    /// Name of the step (`transport`, `timing`, `injection`, ...).
    pub name: String,
    /// Fraction of the charge kept.
    pub efficiency: f64,
}

impl CycleStep {
    /// Creates a step.
    pub fn new(name: impl Into<String>, efficiency: f64) -> Self {
        Self {
            name: name.into(),
            efficiency,
        }
    }
}

/// Result of one stage's part of an injection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    /// Stage prefix.
    pub prefix: String,
    /// Charge entering the stage [C].
    pub received: f64,
    /// Charge leaving (or, for the last stage, stored in) the stage [C].
    pub delivered: f64,
    /// Efficiency factors in the order they were applied.
    pub steps: Vec<CycleStep>,
    /// Cycle handed to the next stage; `None` stops the pipeline.
    #[serde(skip)]
    pub forward: Option<InjectionCycle>,
}

impl CycleOutcome {
    /// Outcome of a stage that stopped the cycle.
    pub fn stopped(prefix: impl Into<String>, received: f64) -> Self {
        Self {
            prefix: prefix.into(),
            received,
            delivered: 0.0,
            steps: Vec::new(),
            forward: None,
        }
    }

    /// `delivered / received`; zero when nothing was received.
    pub fn efficiency(&self) -> f64 {
        if self.received > 0.0 {
            self.delivered / self.received
        } else {
            0.0
        }
    }
}

/// Ratio of two totals, zero when the first one is.
pub(crate) fn ratio(before: f64, after: f64) -> f64 {
    if before > 0.0 {
        after / before
    } else {
        0.0
    }
}
