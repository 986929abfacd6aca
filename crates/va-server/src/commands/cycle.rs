//! `va-server cycle`: one deterministic injection cycle on the caller's thread.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;
use va_core::{ManualClock, VaError};
use va_pipeline::{CycleReport, Orchestrator};

use crate::commands::engine;
use crate::config::resolve;

/// Arguments of `va-server cycle`.
#[derive(Args, Debug, Clone)]
pub struct CycleArgs {
    /// YAML server configuration; defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Total charge injected into the linac [nC]; the electron gun fires when omitted.
    #[arg(long = "charge-nc")]
    pub charge_nc: Option<f64>,
    /// Number of bunches sharing `--charge-nc`.
    #[arg(long, default_value_t = 1)]
    pub bunches: usize,
}

/// Runs the cycle and returns its report.
pub fn run(args: &CycleArgs) -> Result<CycleReport, VaError> {
    let config = resolve(args.config.as_deref())?;
    let charge = initial_charge(args)?;
    let clock = Arc::new(ManualClock::starting_at(0.0));
    let mut orchestrator = Orchestrator::from_machine(&config.machine, engine, clock)?;
    let report = orchestrator.trigger_injection_cycle(charge)?;
    info!(
        stages = report.stages.len(),
        efficiency_pct = report.efficiency * 100.0,
        "cycle command finished"
    );
    Ok(report)
}

fn initial_charge(args: &CycleArgs) -> Result<Option<Vec<f64>>, VaError> {
    let Some(total) = args.charge_nc else {
        return Ok(None);
    };
    if !(total.is_finite() && total >= 0.0) {
        return Err(VaError::config("charge", "initial charge must be finite and non-negative")
            .with_context("charge_nc", total.to_string()));
    }
    if args.bunches == 0 {
        return Err(VaError::config("bunches", "at least one bunch is needed"));
    }
    let per_bunch = total * 1.0e-9 / args.bunches as f64;
    Ok(Some(vec![per_bunch; args.bunches]))
}
