//! Error model of the virtual accelerator.
//!
//! Every failure carries an [`ErrorInfo`]: a stable code that tests and
//! operators match on, a message, and context such as the stage prefix, the
//! PV name or the lattice element involved. The [`VaError`] family says which
//! layer raised it. Optics failures are [`VaError::Numerical`] and dump the
//! beam of the stage that hit them. Rejected client writes are [`VaError::Pv`].
//! A dropped queue between workers is [`VaError::Transport`] and stops the
//! whole pipeline.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code, message and context of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable kebab-case code, e.g. `read-only-pv` or `closed-orbit`.
    pub code: String,
    /// What went wrong.
    pub message: String,
    /// Where it went wrong: `stage`, `pv`, `element`, `path`, ...
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Suggested fix for the operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Payload without context or hint.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Records one context entry; a repeated key keeps the last value.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attaches an operator hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        let mut context = self.context.iter();
        if let Some((key, value)) = context.next() {
            write!(f, " ({key}={value}")?;
            for (key, value) in context {
                write!(f, ", {key}={value}")?;
            }
            write!(f, ")")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "; hint: {hint}")?;
        }
        Ok(())
    }
}

/// Failure raised anywhere in the accelerator server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum VaError {
    /// Closed orbit not found, unstable optics, lost tracking, NaN Twiss.
    #[error("optics: {0}")]
    Numerical(ErrorInfo),
    /// Malformed PV name, unknown PV or write to a read-only PV.
    #[error("pv: {0}")]
    Pv(ErrorInfo),
    /// A worker queue was closed or a worker died.
    #[error("transport: {0}")]
    Transport(ErrorInfo),
    /// Machine or server configuration that cannot be run.
    #[error("config: {0}")]
    Config(ErrorInfo),
    /// YAML/JSON encoding and file access.
    #[error("serde: {0}")]
    Serde(ErrorInfo),
}

impl VaError {
    /// The payload, whatever the family.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            VaError::Numerical(info)
            | VaError::Pv(info)
            | VaError::Transport(info)
            | VaError::Config(info)
            | VaError::Serde(info) => info,
        }
    }

    fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            VaError::Numerical(info)
            | VaError::Pv(info)
            | VaError::Transport(info)
            | VaError::Config(info)
            | VaError::Serde(info) => info,
        }
    }

    /// Optics failure with `code`.
    pub fn numerical(code: &str, message: impl Into<String>) -> Self {
        VaError::Numerical(ErrorInfo::new(code, message))
    }

    /// Configuration failure with `code`.
    pub fn config(code: &str, message: impl Into<String>) -> Self {
        VaError::Config(ErrorInfo::new(code, message))
    }

    /// Adds context while the error travels up, e.g. the step or stage that failed.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info_mut().context.insert(key.into(), value.into());
        self
    }

    /// `true` for optics failures, the ones a stage answers with a beam dump.
    pub fn is_numerical(&self) -> bool {
        matches!(self, VaError::Numerical(_))
    }
}

/// Wraps a file or parse failure as [`VaError::Serde`] with `code`.
pub fn io_error(code: &str, err: impl ToString) -> VaError {
    VaError::Serde(ErrorInfo::new(code, err.to_string()))
}
