//! `va-server run`: the threaded pipeline on the wall clock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Args;
use tracing::info;
use va_core::{PvValue, SystemClock, VaError};
use va_pipeline::Runtime;

use crate::commands::engine;
use crate::config::resolve;

/// Arguments of `va-server run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// YAML server configuration; defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// How long the pipeline runs [s].
    #[arg(long, default_value_t = 2.0)]
    pub seconds: f64,
    /// Injection cycles triggered through `Start-Cmd`, evenly spread over the run.
    #[arg(long, default_value_t = 0)]
    pub cycles: u32,
}

/// Runs the pipeline and returns the final value of every PV.
pub fn run(args: &RunArgs) -> Result<BTreeMap<String, PvValue>, VaError> {
    if !(args.seconds.is_finite() && args.seconds >= 0.0) {
        return Err(VaError::config("seconds", "run time must be finite and non-negative")
            .with_context("seconds", args.seconds.to_string()));
    }
    let config = resolve(args.config.as_deref())?;
    let runtime = Runtime::from_machine(
        &config.machine,
        engine,
        SystemClock::shared(),
        config.fluctuation_table()?,
        config.interval(),
    )?;

    let slot = Duration::from_secs_f64(args.seconds) / args.cycles.saturating_add(1);
    let client = runtime.client();
    for cycle in 1..=args.cycles {
        thread::sleep(slot);
        if runtime.is_stopping() {
            break;
        }
        client.start_cycle()?;
        info!(cycle, of = args.cycles, "injection cycle requested");
    }
    thread::sleep(slot);

    let values = runtime.reader().values();
    runtime.shutdown()?;
    Ok(values)
}
