//! Process-variable names and values.
//!
//! Names follow the `SEC-SUB:DIS-DEV[-IDX]:Property[-Suffix]` convention, for
//! example `SI-Fam:PS-QF:Current-SP` or `BO-Glob:DI-DCCT:Current-Mon`. The
//! suffix decides whether a client may write the PV.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, VaError};

/// Sentinel reported for physically undefined quantities (tunes without beam, ...).
pub const UNDEF_VALUE: f64 = 0.0;

/// Discipline field of a PV name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Discipline {
    /// Power supplies of DC magnets.
    PS,
    /// Pulsed power supplies (kickers, septa).
    PU,
    /// Diagnostics (DCCT, BPM, tune monitors).
    DI,
    /// RF cavities.
    RF,
    /// Accelerator physics derived quantities.
    AP,
    /// Fake devices used for error injection.
    FK,
    /// Timing system.
    TI,
    /// Virtual-accelerator-only commands.
    VA,
    /// Model constants.
    MO,
    /// Anything else; carried verbatim.
    Other(String),
}

impl Discipline {
    /// Parses a discipline code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "PS" => Discipline::PS,
            "PU" => Discipline::PU,
            "DI" => Discipline::DI,
            "RF" => Discipline::RF,
            "AP" => Discipline::AP,
            "FK" => Discipline::FK,
            "TI" => Discipline::TI,
            "VA" => Discipline::VA,
            "MO" => Discipline::MO,
            other => Discipline::Other(other.to_string()),
        }
    }

    /// Returns the textual code.
    pub fn as_str(&self) -> &str {
        match self {
            Discipline::PS => "PS",
            Discipline::PU => "PU",
            Discipline::DI => "DI",
            Discipline::RF => "RF",
            Discipline::AP => "AP",
            Discipline::FK => "FK",
            Discipline::TI => "TI",
            Discipline::VA => "VA",
            Discipline::MO => "MO",
            Discipline::Other(code) => code,
        }
    }
}

/// Property suffix of a PV name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertySuffix {
    /// Setpoint.
    Sp,
    /// Enumerated selection.
    Sel,
    /// Command.
    Cmd,
    /// Readback of a setpoint.
    Rb,
    /// Status readback of a selection.
    Sts,
    /// Monitored value.
    Mon,
    /// Constant.
    Cte,
}

impl PropertySuffix {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "SP" => Some(PropertySuffix::Sp),
            "Sel" => Some(PropertySuffix::Sel),
            "Cmd" => Some(PropertySuffix::Cmd),
            "RB" => Some(PropertySuffix::Rb),
            "Sts" => Some(PropertySuffix::Sts),
            "Mon" => Some(PropertySuffix::Mon),
            "Cte" => Some(PropertySuffix::Cte),
            _ => None,
        }
    }

    /// Returns the textual code.
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertySuffix::Sp => "SP",
            PropertySuffix::Sel => "Sel",
            PropertySuffix::Cmd => "Cmd",
            PropertySuffix::Rb => "RB",
            PropertySuffix::Sts => "Sts",
            PropertySuffix::Mon => "Mon",
            PropertySuffix::Cte => "Cte",
        }
    }
}

/// Access mode of a PV as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PvAccess {
    /// Clients may write.
    ReadWrite,
    /// Maintained by the server only.
    ReadOnly,
    /// Fixed at start-up.
    Constant,
}

impl PvAccess {
    /// Returns `true` when client writes are accepted.
    pub fn is_writable(&self) -> bool {
        matches!(self, PvAccess::ReadWrite)
    }
}

/// Parsed process-variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PvName {
    /// Accelerator section (`LI`, `TB`, `BO`, `TS`, `SI`, `AS`).
    pub section: String,
    /// Sub-section (`Glob`, `Fam`, `01`, ...).
    pub subsection: String,
    /// Discipline.
    pub discipline: Discipline,
    /// Device type.
    pub device: String,
    /// Optional device index.
    pub index: Option<String>,
    /// Property without suffix.
    pub property: String,
    /// Optional suffix.
    pub suffix: Option<PropertySuffix>,
}

impl PvName {
    /// Parses a full PV name.
    pub fn parse(raw: &str) -> Result<Self, VaError> {
        let malformed = || {
            VaError::Pv(
                ErrorInfo::new("malformed-pv-name", "pv name must have three ':' separated fields")
                    .with_context("pv", raw),
            )
        };
        let mut fields = raw.split(':');
        let (area, device, property) = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(d), Some(p)) if fields.next().is_none() => (a, d, p),
            _ => return Err(malformed()),
        };
        if area.is_empty() || device.is_empty() || property.is_empty() {
            return Err(malformed());
        }

        let (section, subsection) = match area.split_once('-') {
            Some((sec, sub)) => (sec.to_string(), sub.to_string()),
            None => (area.to_string(), String::new()),
        };

        let mut device_parts = device.splitn(3, '-');
        let discipline = device_parts.next().map(Discipline::from_code).ok_or_else(malformed)?;
        let device_type = device_parts.next().ok_or_else(malformed)?.to_string();
        let index = device_parts.next().map(str::to_string);

        let (property, suffix) = match property.rsplit_once('-') {
            Some((head, tail)) => match PropertySuffix::from_code(tail) {
                Some(suffix) => (head.to_string(), Some(suffix)),
                None => (property.to_string(), None),
            },
            None => (property.to_string(), None),
        };

        Ok(Self {
            section,
            subsection,
            discipline,
            device: device_type,
            index,
            property,
            suffix,
        })
    }

    /// Returns `SEC-SUB:DIS-DEV[-IDX]`, the key of the owning device.
    pub fn device_name(&self) -> String {
        let mut name = self.area();
        name.push(':');
        name.push_str(self.discipline.as_str());
        name.push('-');
        name.push_str(&self.device);
        if let Some(index) = &self.index {
            name.push('-');
            name.push_str(index);
        }
        name
    }

    /// Returns `SEC-SUB` (or only `SEC` when there is no sub-section).
    pub fn area(&self) -> String {
        if self.subsection.is_empty() {
            self.section.clone()
        } else {
            format!("{}-{}", self.section, self.subsection)
        }
    }

    /// Property with its suffix, e.g. `Current-SP`.
    pub fn property_with_suffix(&self) -> String {
        match self.suffix {
            Some(suffix) => format!("{}-{}", self.property, suffix.as_str()),
            None => self.property.clone(),
        }
    }

    /// Returns a copy with a different suffix.
    pub fn with_suffix(&self, suffix: Option<PropertySuffix>) -> Self {
        Self {
            suffix,
            ..self.clone()
        }
    }

    /// Readback mirror of a setpoint (`-SP → -RB`, `-Sel → -Sts`).
    pub fn readback(&self) -> Option<Self> {
        match self.suffix {
            Some(PropertySuffix::Sp) => Some(self.with_suffix(Some(PropertySuffix::Rb))),
            Some(PropertySuffix::Sel) => Some(self.with_suffix(Some(PropertySuffix::Sts))),
            _ => None,
        }
    }

    /// Access mode implied by the suffix.
    pub fn access(&self) -> PvAccess {
        match self.suffix {
            Some(PropertySuffix::Sp | PropertySuffix::Sel | PropertySuffix::Cmd) | None => {
                PvAccess::ReadWrite
            }
            Some(PropertySuffix::Rb | PropertySuffix::Sts | PropertySuffix::Mon) => {
                PvAccess::ReadOnly
            }
            Some(PropertySuffix::Cte) => PvAccess::Constant,
        }
    }

    /// Returns `true` when the property (without suffix) matches `property`.
    pub fn is(&self, discipline: &Discipline, property: &str) -> bool {
        &self.discipline == discipline && self.property == property
    }
}

impl Display for PvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_name(), self.property_with_suffix())
    }
}

/// Value carried by a PV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Scalar value.
    Scalar(f64),
    /// Fixed-length waveform.
    Array(Vec<f64>),
}

impl PvValue {
    /// Returns the scalar, or the first element of an array.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            PvValue::Scalar(value) => Some(*value),
            PvValue::Array(values) => values.first().copied(),
        }
    }

    /// Returns the value as a slice of samples.
    pub fn as_slice(&self) -> &[f64] {
        match self {
            PvValue::Scalar(value) => std::slice::from_ref(value),
            PvValue::Array(values) => values,
        }
    }

    /// Interprets the value as a boolean flag (non-zero is `true`).
    pub fn as_flag(&self) -> Option<bool> {
        self.as_scalar().map(|value| value != 0.0)
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Scalar(value)
    }
}

impl From<bool> for PvValue {
    fn from(value: bool) -> Self {
        PvValue::Scalar(if value { 1.0 } else { 0.0 })
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(values: Vec<f64>) -> Self {
        PvValue::Array(values)
    }
}
