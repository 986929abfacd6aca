//! Server configuration file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use va_core::{io_error, VaError};
use va_stage::{FluctuationRule, FluctuationTable, MachineConfig};

/// Everything the server needs besides the optics engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Processing interval of every worker [ms].
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Master seed of the fluctuation noise.
    #[serde(default)]
    pub seed: u64,
    /// Noise added to dynamic PVs; the first matching rule wins.
    #[serde(default)]
    pub fluctuations: Vec<FluctuationRule>,
    /// Machine layout.
    #[serde(default)]
    pub machine: MachineConfig,
}

fn default_interval_ms() -> u64 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            seed: 0,
            fluctuations: Vec::new(),
            machine: MachineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Processing interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Compiled fluctuation rules seeded with [`ServerConfig::seed`].
    pub fn fluctuation_table(&self) -> Result<FluctuationTable, VaError> {
        FluctuationTable::new(self.fluctuations.clone(), self.seed)
    }

    /// Checks the interval and the machine.
    pub fn validate(&self) -> Result<(), VaError> {
        if self.interval_ms == 0 {
            return Err(VaError::config("interval", "processing interval must be positive")
                .with_context("interval_ms", "0"));
        }
        self.machine.validate()
    }
}

/// Reads and validates a YAML server configuration.
pub fn load_server_config(path: &Path) -> Result<ServerConfig, VaError> {
    let bytes = fs::read(path).map_err(|err| {
        io_error("server-config-read", err).with_context("path", path.display().to_string())
    })?;
    let config: ServerConfig = serde_yaml::from_slice(&bytes).map_err(|err| {
        io_error("yaml_deserialize", err).with_context("path", path.display().to_string())
    })?;
    config.validate()?;
    Ok(config)
}

/// Configuration from `path`, or the defaults when no path is given.
pub fn resolve(path: Option<&Path>) -> Result<ServerConfig, VaError> {
    match path {
        Some(path) => load_server_config(path),
        None => Ok(ServerConfig::default()),
    }
}
