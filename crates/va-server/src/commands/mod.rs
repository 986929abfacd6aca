//! One module per subcommand; each exposes its clap arguments and a `run` function.

use va_optics::{LinearEngine, OpticsEngine};

pub mod cycle;
pub mod defaults;
pub mod pvs;
pub mod run;

/// Optics engine used by every command.
pub fn engine() -> Box<dyn OpticsEngine> {
    Box::new(LinearEngine::new())
}
