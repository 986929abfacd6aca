//! Worker contract shared by stage areas and the timing area.

use tracing::{debug, warn};
use va_core::{PvValue, VaError};
use va_stage::{PvEntry, Refresh, StageController, StageOutput};

use crate::messages::StageMessage;

/// Side effect produced by an area during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum AreaOutput {
    /// Value for the PV database.
    Push {
        /// PV name.
        pv: String,
        /// Value to store.
        value: PvValue,
    },
    /// Message for the downstream neighbour.
    Downstream(StageMessage),
}

/// One isolated unit of work driven by its own worker.
pub trait Area: Send {
    /// Section prefix owning the area's PVs.
    fn prefix(&self) -> &str;

    /// Processes one inbound message.
    fn handle(&mut self, message: StageMessage) -> Result<(), VaError>;

    /// Refreshes derived state and queues the resulting PV pushes.
    fn update_state(&mut self);

    /// Drains queued outputs.
    fn take_outputs(&mut self) -> Vec<AreaOutput>;

    /// PVs owned by the area.
    fn pv_table(&self) -> Vec<PvEntry>;

    /// Values seeding the PV database.
    fn initial_values(&mut self) -> Vec<(String, PvValue)>;
}

/// Stage controller driven as an area.
#[derive(Debug)]
pub struct StageArea {
    stage: StageController,
    outputs: Vec<AreaOutput>,
}

impl StageArea {
    /// Wraps a stage.
    pub fn new(stage: StageController) -> Self {
        Self {
            stage,
            outputs: Vec::new(),
        }
    }

    /// The wrapped stage.
    pub fn stage(&self) -> &StageController {
        &self.stage
    }

    fn collect_stage_outputs(&mut self) {
        for output in self.stage.take_outputs() {
            self.outputs.push(match output {
                StageOutput::PushPv { name, value } => AreaOutput::Push { pv: name, value },
                StageOutput::ForwardParameters(parameters) => {
                    AreaOutput::Downstream(StageMessage::ForwardPhysicsParameters(parameters))
                }
            });
        }
    }

    fn push_values(&mut self, refresh: Refresh) {
        for (pv, value) in self.stage.pv_values(refresh) {
            self.outputs.push(AreaOutput::Push { pv, value });
        }
    }
}

impl Area for StageArea {
    fn prefix(&self) -> &str {
        self.stage.prefix()
    }

    fn handle(&mut self, message: StageMessage) -> Result<(), VaError> {
        match message {
            StageMessage::SetParameter { pv, value } => {
                if !self.stage.set(&pv, value) {
                    debug!(stage = %self.stage.prefix(), pv = %pv, "write not applied");
                }
            }
            StageMessage::ForwardPhysicsParameters(parameters) => {
                self.stage.handle_parameters(parameters);
            }
            StageMessage::RunInjectionCycle(cycle) => {
                let outcome = self.stage.run_injection_cycle(cycle)?;
                match outcome.forward {
                    Some(forward) => self
                        .outputs
                        .push(AreaOutput::Downstream(StageMessage::RunInjectionCycle(forward))),
                    None => debug!(stage = %self.stage.prefix(), "cycle ends here"),
                }
            }
        }
        self.collect_stage_outputs();
        Ok(())
    }

    fn update_state(&mut self) {
        self.stage.update_state(false);
        self.collect_stage_outputs();
        self.push_values(Refresh::Dynamic);
        if self.stage.take_state_changed() {
            self.push_values(Refresh::OnStateChange);
        }
    }

    fn take_outputs(&mut self) -> Vec<AreaOutput> {
        std::mem::take(&mut self.outputs)
    }

    fn pv_table(&self) -> Vec<PvEntry> {
        self.stage.pv_table()
    }

    fn initial_values(&mut self) -> Vec<(String, PvValue)> {
        let values = self.stage.initial_values();
        if values.len() < self.stage.registry().len() {
            warn!(
                stage = %self.stage.prefix(),
                missing = self.stage.registry().len() - values.len(),
                "some pvs have no initial value"
            );
        }
        values
    }
}
