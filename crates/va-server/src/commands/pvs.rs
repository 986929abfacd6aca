//! `va-server pvs`: the PV table of every area.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use va_core::{ManualClock, VaError};
use va_pipeline::machine_areas;
use va_stage::PvEntry;

use crate::commands::engine;
use crate::config::resolve;

/// Arguments of `va-server pvs`.
#[derive(Args, Debug, Clone)]
pub struct PvsArgs {
    /// YAML server configuration; defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Every PV the server would publish, area by area.
pub fn run(args: &PvsArgs) -> Result<Vec<PvEntry>, VaError> {
    let config = resolve(args.config.as_deref())?;
    let areas = machine_areas(
        &config.machine,
        engine,
        Arc::new(ManualClock::starting_at(0.0)),
    )?;
    Ok(areas.iter().flat_map(|area| area.pv_table()).collect())
}
