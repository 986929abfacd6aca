#![deny(missing_docs)]
#![doc = "Core types shared by the virtual accelerator crates: the error model, PV names and values, clocks, noise and physical constants."]

pub mod clock;
pub mod errors;
pub mod logging;
pub mod noise;
pub mod pv;
pub mod units;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{io_error, ErrorInfo, VaError};
pub use noise::{derive_pv_seed, NoiseSource};
pub use pv::{Discipline, PropertySuffix, PvAccess, PvName, PvValue, UNDEF_VALUE};

