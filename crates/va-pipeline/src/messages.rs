//! Messages exchanged between workers.
//!
//! Every payload is owned: charge moves from stage to stage inside an
//! [`InjectionCycle`] and is never shared.

use serde::{Deserialize, Serialize};
use va_core::PvValue;
use va_stage::{InjectionCycle, PhysicsParameters};

/// Inbound message of an area worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum StageMessage {
    /// Client write routed by the PV driver.
    SetParameter {
        /// PV name.
        pv: String,
        /// Written value.
        value: PvValue,
    },
    /// Parameters published by the upstream neighbour.
    ForwardPhysicsParameters(PhysicsParameters),
    /// Charge handed over by the upstream neighbour.
    RunInjectionCycle(InjectionCycle),
}

/// Inbound message of the PV driver worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum DriverMessage {
    /// New value computed by an area.
    Update {
        /// PV name.
        pv: String,
        /// Value to store.
        value: PvValue,
    },
    /// Write requested by a client.
    ClientWrite {
        /// PV name.
        pv: String,
        /// Requested value.
        value: PvValue,
    },
    /// Operator-facing notice.
    Alert(String),
}
