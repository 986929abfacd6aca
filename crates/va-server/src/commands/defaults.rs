//! `va-server config`: the default configuration as YAML.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use va_core::{io_error, VaError};

use crate::config::ServerConfig;

/// Arguments of `va-server config`.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// File to write; the YAML goes to stdout when omitted.
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Renders the defaults and writes them to `--out` when given.
pub fn run(args: &ConfigArgs) -> Result<String, VaError> {
    let text = serde_yaml::to_string(&ServerConfig::default())
        .map_err(|err| io_error("yaml_serialize", err))?;
    if let Some(path) = &args.out {
        fs::write(path, &text).map_err(|err| {
            io_error("server-config-write", err).with_context("path", path.display().to_string())
        })?;
    }
    Ok(text)
}
