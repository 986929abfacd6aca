#![deny(missing_docs)]
#![doc = "Stage controllers of the virtual accelerator: configuration, device registry, PV dispatch, physics refresh and injection cycles."]

pub mod config;
pub mod controller;
pub mod cycle;
pub mod devices;
pub mod fluctuations;
pub mod kinds;
pub mod registry;

pub use config::{
    load_machine, save_machine, BeamConfig, EGunConfig, EjectionConfig, MachineConfig,
    MagnetField, PowerSupplyConfig, PulsedMagnetConfig, PulsedRole, RampConfig, StageConfig,
    TimingConfig,
};
pub use controller::{PhysicsCache, StageController, StageOutput, StageState};
pub use cycle::{CycleOutcome, CycleStep, InjectionCycle, PhysicsParameters};
pub use devices::{reslot, CurrentChange, KickerGuard, PowerSupply, PulsedMagnet};
pub use fluctuations::{FluctuationRule, FluctuationTable};
pub use kinds::{KindHooks, StageKind};
pub use registry::{DeviceRegistry, Devices, PvEntry, Refresh};
