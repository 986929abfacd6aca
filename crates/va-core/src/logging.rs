//! Global tracing subscriber set-up for binaries.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) and a fmt layer on stderr.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with_default("info")
}

/// Same as [`init_tracing`] with a custom fallback directive.
pub fn init_tracing_with_default(default_directive: &str) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stderr().is_terminal();
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|err| InitError::Directive(err.to_string()))?,
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(ansi);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;
    Ok(())
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A subscriber was already installed by this process.
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    /// The fallback filter directive did not parse.
    #[error("invalid filter directive: {0}")]
    Directive(String),
    /// Another global subscriber was installed behind our back.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}
