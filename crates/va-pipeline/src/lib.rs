#![deny(missing_docs)]
#![doc = "Injection-cycle pipeline of the virtual accelerator: inter-stage messages, the cycle timing area, the in-process orchestrator and the threaded runtime with its PV database."]

pub mod area;
pub mod driver;
pub mod messages;
pub mod orchestrator;
pub mod runtime;
pub mod timing;

pub use area::{Area, AreaOutput, StageArea};
pub use driver::{PvDatabase, PvReader, PvRecord};
pub use messages::{DriverMessage, StageMessage};
pub use orchestrator::{CycleReport, Orchestrator};
pub use runtime::{machine_areas, PvClient, Runtime, DEFAULT_INTERVAL};
pub use timing::{CycleTiming, CYCLE_DEVICE, TIMING_PREFIX};
