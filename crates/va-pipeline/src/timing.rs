//! Injection-cycle timing master (`AS-Glob:TI-Cycle`).

use tracing::{info, warn};
use va_core::{PvName, PvValue, VaError};
use va_stage::{InjectionCycle, MachineConfig, PvEntry, Refresh, TimingConfig};

use crate::area::{Area, AreaOutput};
use crate::messages::StageMessage;

/// Section prefix of the timing area.
pub const TIMING_PREFIX: &str = "AS";
/// Device of the cycle timing PVs.
pub const CYCLE_DEVICE: &str = "AS-Glob:TI-Cycle";

/// Linac RF periods between two consecutive bunches.
const RF_PERIODS_PER_BUNCH: f64 = 6.0;

/// Injection bunch, its increment and the cycle trigger.
#[derive(Debug, Clone)]
pub struct CycleTiming {
    linac_frequency: f64,
    injection_bunch: usize,
    increment: usize,
    bunch_slots: usize,
    outputs: Vec<AreaOutput>,
}

impl CycleTiming {
    /// Timing master starting from `config`, with no ring to bound the bunch number.
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            linac_frequency: config.linac_frequency,
            injection_bunch: config.injection_bunch,
            increment: config.increment,
            bunch_slots: usize::MAX,
            outputs: Vec::new(),
        }
    }

    /// Timing master of `machine`; bunch numbers wrap at its last ring's harmonic number.
    pub fn for_machine(machine: &MachineConfig) -> Self {
        let timing = Self::new(&machine.timing);
        match machine.bunch_slots() {
            Some(slots) => timing.with_bunch_slots(slots),
            None => timing,
        }
    }

    /// Bounds the injection bunch to `slots` buckets.
    pub fn with_bunch_slots(mut self, slots: usize) -> Self {
        self.bunch_slots = slots.max(1);
        self.injection_bunch %= self.bunch_slots;
        self
    }

    /// Buckets the injection bunch may address.
    pub fn bunch_slots(&self) -> usize {
        self.bunch_slots
    }

    /// Time between linac bunches [s].
    pub fn bunch_separation(&self) -> f64 {
        RF_PERIODS_PER_BUNCH / self.linac_frequency
    }

    /// Storage-ring bucket targeted by the next cycle.
    pub fn injection_bunch(&self) -> usize {
        self.injection_bunch
    }

    /// Buckets added to the injection bunch after each cycle.
    pub fn increment(&self) -> usize {
        self.increment
    }

    /// Delay of the timing master for the next cycle [s].
    pub fn master_delay(&self) -> f64 {
        self.injection_bunch as f64 * self.bunch_separation()
    }

    /// Builds the next cycle and advances the injection bunch.
    ///
    /// `charge` overrides the electron-gun output.
    pub fn next_cycle(&mut self, charge: Option<Vec<f64>>) -> InjectionCycle {
        let mut cycle = InjectionCycle::shot(self.injection_bunch, self.bunch_separation());
        if let Some(charge) = charge {
            cycle = cycle.with_charge(charge);
        }
        if self.increment > 0 {
            let next = (self.injection_bunch as u128 + self.increment as u128)
                % self.bunch_slots as u128;
            self.injection_bunch = next as usize;
            let bunch = self.injection_bunch as f64;
            self.push("InjBun-SP", bunch);
            self.push("InjBun-RB", bunch);
        }
        cycle
    }

    fn push(&mut self, property: &str, value: f64) {
        self.outputs.push(AreaOutput::Push {
            pv: format!("{CYCLE_DEVICE}:{property}"),
            value: PvValue::Scalar(value),
        });
    }

    fn get(&self, pv: &PvName) -> Option<PvValue> {
        if pv.device_name() != CYCLE_DEVICE {
            return None;
        }
        let value = match pv.property_with_suffix().as_str() {
            "InjBun-SP" | "InjBun-RB" => self.injection_bunch as f64,
            "InjBunIncr-SP" | "InjBunIncr-RB" => self.increment as f64,
            "Start-Cmd" => 0.0,
            _ => return None,
        };
        Some(PvValue::Scalar(value))
    }

    /// Applies a client write; returns `true` when handled.
    pub fn set(&mut self, name: &str, value: &PvValue) -> bool {
        let Ok(pv) = PvName::parse(name) else {
            return false;
        };
        if pv.device_name() != CYCLE_DEVICE {
            return false;
        }
        let property = pv.property_with_suffix();
        let Some(number) = value.as_scalar().filter(|v| v.is_finite()) else {
            warn!(pv = name, ?value, "timing write rejected, value is not a finite number");
            return false;
        };
        match property.as_str() {
            "InjBun-SP" | "InjBunIncr-SP" => {
                let bunch_slots = self.bunch_slots;
                let out_of_range = property == "InjBun-SP" && number >= bunch_slots as f64;
                let (field, readback) = if property == "InjBun-SP" {
                    (&mut self.injection_bunch, "InjBun-RB")
                } else {
                    (&mut self.increment, "InjBunIncr-RB")
                };
                if number < 0.0 || number.fract() != 0.0 || out_of_range {
                    warn!(
                        pv = name,
                        value = number,
                        bunch_slots,
                        "bunch numbers must be non-negative integers inside the ring"
                    );
                    let previous = *field as f64;
                    self.push(&property, previous);
                    return true;
                }
                *field = number as usize;
                self.push(readback, number);
                true
            }
            "Start-Cmd" => {
                let cycle = self.next_cycle(None);
                info!(
                    injection_bunch = cycle.injection_bunch,
                    master_delay = cycle.master_delay,
                    "injection cycle started"
                );
                self.outputs
                    .push(AreaOutput::Downstream(StageMessage::RunInjectionCycle(cycle)));
                true
            }
            _ => false,
        }
    }

    fn entries() -> Vec<PvEntry> {
        ["InjBun-SP", "InjBun-RB", "InjBunIncr-SP", "InjBunIncr-RB", "Start-Cmd"]
            .into_iter()
            .map(|property| PvEntry::new(format!("{CYCLE_DEVICE}:{property}"), Refresh::Setpoint))
            .collect()
    }
}

impl Area for CycleTiming {
    fn prefix(&self) -> &str {
        TIMING_PREFIX
    }

    fn handle(&mut self, message: StageMessage) -> Result<(), VaError> {
        match message {
            StageMessage::SetParameter { pv, value } => {
                if !self.set(&pv, &value) {
                    warn!(pv = %pv, "pv not handled by the timing area");
                }
            }
            other => warn!(message = ?other, "timing area ignores inter-stage messages"),
        }
        Ok(())
    }

    fn update_state(&mut self) {}

    fn take_outputs(&mut self) -> Vec<AreaOutput> {
        std::mem::take(&mut self.outputs)
    }

    fn pv_table(&self) -> Vec<PvEntry> {
        Self::entries()
    }

    fn initial_values(&mut self) -> Vec<(String, PvValue)> {
        Self::entries()
            .into_iter()
            .filter_map(|entry| {
                let pv = PvName::parse(&entry.name).ok()?;
                self.get(&pv).map(|value| (entry.name, value))
            })
            .collect()
    }
}
