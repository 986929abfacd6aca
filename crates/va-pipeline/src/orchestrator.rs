//! In-process pipeline: stages updated and cycled in beam order on the caller's thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use va_core::{Clock, ErrorInfo, PvName, PvValue, VaError};
use va_optics::OpticsEngine;
use va_stage::{CycleOutcome, MachineConfig, StageController, StageKind, StageOutput};

use crate::timing::{CycleTiming, TIMING_PREFIX};

/// Summary of one injection cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    /// Storage-ring bucket targeted by the cycle.
    pub injection_bunch: usize,
    /// Charge produced by the linac [C].
    pub initial_charge: f64,
    /// Charge delivered by the last stage reached [C].
    pub final_charge: f64,
    /// `final_charge / initial_charge`, zero without initial charge.
    pub efficiency: f64,
    /// Stage outcomes in beam order, up to the stage where the cycle ended.
    pub stages: Vec<CycleOutcome>,
}

impl CycleReport {
    /// Outcome of the stage with `prefix`.
    pub fn stage(&self, prefix: &str) -> Option<&CycleOutcome> {
        self.stages.iter().find(|outcome| outcome.prefix == prefix)
    }
}

/// Stages in beam order plus the cycle timing.
#[derive(Debug)]
pub struct Orchestrator {
    stages: Vec<StageController>,
    timing: CycleTiming,
    pushes: Vec<(String, PvValue)>,
}

impl Orchestrator {
    /// Pipeline over `stages`, which must start with a linac.
    pub fn new(stages: Vec<StageController>, timing: CycleTiming) -> Result<Self, VaError> {
        match stages.first() {
            Some(head) if head.kind() == StageKind::Linac => {}
            Some(head) => {
                return Err(VaError::Config(
                    ErrorInfo::new("pipeline-head", "the first stage must be a linac")
                        .with_context("prefix", head.prefix()),
                ))
            }
            None => return Err(VaError::config("empty-machine", "pipeline has no stages")),
        }
        Ok(Self {
            stages,
            timing,
            pushes: Vec::new(),
        })
    }

    /// Builds every stage of `machine`; `engine` is called once per stage.
    pub fn from_machine(
        machine: &MachineConfig,
        mut engine: impl FnMut() -> Box<dyn OpticsEngine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaError> {
        machine.validate()?;
        let stages = machine
            .stages
            .iter()
            .map(|config| StageController::new(config.clone(), engine(), Arc::clone(&clock)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stages, CycleTiming::for_machine(machine))
    }

    /// Stages in beam order.
    pub fn stages(&self) -> &[StageController] {
        &self.stages
    }

    /// Stage with `prefix`.
    pub fn stage(&self, prefix: &str) -> Option<&StageController> {
        self.stages.iter().find(|stage| stage.prefix() == prefix)
    }

    /// Mutable stage with `prefix`.
    pub fn stage_mut(&mut self, prefix: &str) -> Option<&mut StageController> {
        self.stages.iter_mut().find(|stage| stage.prefix() == prefix)
    }

    /// Cycle timing.
    pub fn timing(&self) -> &CycleTiming {
        &self.timing
    }

    /// Drains the PV values pushed by the stages since the last call.
    pub fn take_pushes(&mut self) -> Vec<(String, PvValue)> {
        std::mem::take(&mut self.pushes)
    }

    /// Writes a PV of any stage or of the timing area.
    pub fn set(&mut self, name: &str, value: PvValue) -> bool {
        let Ok(pv) = PvName::parse(name) else {
            warn!(pv = name, "cannot route malformed pv");
            return false;
        };
        if pv.section == TIMING_PREFIX {
            return self.timing.set(name, &value);
        }
        let Some(idx) = self.index_of(&pv.section) else {
            warn!(pv = name, "no stage owns the pv");
            return false;
        };
        let handled = self.stages[idx].set(name, value);
        self.route_outputs(idx);
        handled
    }

    /// Reads a PV of any stage.
    pub fn get(&mut self, name: &str) -> Option<PvValue> {
        let section = PvName::parse(name).ok()?.section;
        let idx = self.index_of(&section)?;
        self.stages[idx].get(name)
    }

    fn index_of(&self, prefix: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.prefix() == prefix)
    }

    /// Updates every stage upstream first.
    ///
    /// Parameters published by stage `i` reach stage `i + 1` before it
    /// updates, so each stage sees its neighbour's completed recompute.
    pub fn update_all(&mut self) {
        for idx in 0..self.stages.len() {
            self.stages[idx].update_state(false);
            self.route_outputs(idx);
        }
    }

    /// Sends the latest completed parameters of stage `idx` downstream.
    ///
    /// Returns `false` when there is no downstream stage or nothing was published yet.
    pub fn propagate_parameters(&mut self, idx: usize) -> bool {
        if idx + 1 >= self.stages.len() {
            return false;
        }
        let Some(parameters) = self.stages[idx].latest_parameters().cloned() else {
            return false;
        };
        debug!(from = %self.stages[idx].prefix(), to = %self.stages[idx + 1].prefix(), "parameters propagated");
        self.stages[idx + 1].receive_parameters(parameters);
        true
    }

    /// Applies pulsed-magnet delays from the head of the pipeline downstream.
    pub fn update_delays(&mut self, delays: BTreeMap<String, f64>) {
        if self.stages.is_empty() {
            return;
        }
        self.stages[0].update_delays(&delays);
        for idx in 0..self.stages.len() {
            self.route_outputs(idx);
        }
    }

    /// Delivers pushes and forwards of stage `idx`.
    fn route_outputs(&mut self, idx: usize) {
        for output in self.stages[idx].take_outputs() {
            match output {
                StageOutput::PushPv { name, value } => self.pushes.push((name, value)),
                StageOutput::ForwardParameters(parameters) => match self.stages.get_mut(idx + 1) {
                    Some(next) => next.handle_parameters(parameters),
                    None => {
                        debug!(stage = %self.stages[idx].prefix(), ?parameters, "last stage, parameters dropped")
                    }
                },
            }
        }
    }

    /// Runs one injection cycle through every stage in beam order.
    ///
    /// `initial_charge` replaces the electron-gun output. The cycle ends at
    /// the first stage that forwards nothing.
    pub fn trigger_injection_cycle(
        &mut self,
        initial_charge: Option<Vec<f64>>,
    ) -> Result<CycleReport, VaError> {
        self.update_all();
        let mut cycle = Some(self.timing.next_cycle(initial_charge));
        let injection_bunch = cycle.as_ref().map_or(0, |cycle| cycle.injection_bunch);
        let mut outcomes = Vec::with_capacity(self.stages.len());
        for idx in 0..self.stages.len() {
            let Some(incoming) = cycle.take() else {
                break;
            };
            let outcome = self.stages[idx].run_injection_cycle(incoming)?;
            self.route_outputs(idx);
            info!(
                stage = %outcome.prefix,
                efficiency_pct = outcome.efficiency() * 100.0,
                "stage efficiency"
            );
            cycle = outcome.forward.clone();
            outcomes.push(outcome);
        }

        let initial = outcomes.first().map_or(0.0, |outcome| outcome.received);
        let final_charge = match outcomes.last() {
            Some(last) if outcomes.len() == self.stages.len() => last.delivered,
            _ => 0.0,
        };
        let efficiency = if initial > 0.0 {
            final_charge / initial
        } else {
            0.0
        };
        info!(
            initial_charge = initial,
            final_charge,
            efficiency_pct = efficiency * 100.0,
            "injection cycle finished"
        );
        Ok(CycleReport {
            injection_bunch,
            initial_charge: initial,
            final_charge,
            efficiency,
            stages: outcomes,
        })
    }
}
