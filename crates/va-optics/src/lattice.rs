//! Lattice description consumed by the optics engine.
//!
//! A lattice is an ordered list of thick or thin elements. Family names are
//! carried on every element so that power supplies and pulsed magnets can find
//! the elements they drive.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use va_core::units::LIGHT_SPEED;
use va_core::{ErrorInfo, VaError};

/// Physical type of a lattice element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    /// Zero-length reference point.
    Marker,
    /// Beam position monitor.
    Bpm,
    /// Field-free drift.
    Drift,
    /// Quadrupole with normalised gradient `k` [1/m²]; positive focuses horizontally.
    Quadrupole {
        /// Normalised gradient.
        k: f64,
    },
    /// Sector dipole bending by `angle` [rad].
    Dipole {
        /// Bending angle.
        angle: f64,
    },
    /// Orbit corrector.
    Corrector {
        /// Horizontal kick [rad].
        #[serde(default)]
        hkick: f64,
        /// Vertical kick [rad].
        #[serde(default)]
        vkick: f64,
    },
    /// Pulsed horizontal kicker or septum.
    Kicker {
        /// Horizontal kick [rad]; zero while the magnet is not pulsing.
        #[serde(default)]
        angle: f64,
    },
    /// RF cavity.
    Cavity {
        /// Peak voltage [V].
        voltage: f64,
        /// RF frequency [Hz].
        frequency: f64,
    },
}

/// One lattice element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Family name (`QF`, `B`, `BPM`, `InjNLKckr`, ...).
    pub family: String,
    /// Element physics.
    pub kind: ElementKind,
    /// Length [m].
    #[serde(default)]
    pub length: f64,
    /// Lower horizontal chamber limit [m].
    #[serde(default = "default_hmin")]
    pub hmin: f64,
    /// Upper horizontal chamber limit [m].
    #[serde(default = "default_hmax")]
    pub hmax: f64,
    /// Lower vertical chamber limit [m].
    #[serde(default = "default_vmin")]
    pub vmin: f64,
    /// Upper vertical chamber limit [m].
    #[serde(default = "default_vmax")]
    pub vmax: f64,
    /// Horizontal misalignment [m].
    #[serde(default)]
    pub dx: f64,
    /// Vertical misalignment [m].
    #[serde(default)]
    pub dy: f64,
    /// Roll around the longitudinal axis [rad].
    #[serde(default)]
    pub roll: f64,
}

/// Default horizontal half-aperture [m].
pub const DEFAULT_HALF_APERTURE_H: f64 = 0.012;
/// Default vertical half-aperture [m].
pub const DEFAULT_HALF_APERTURE_V: f64 = 0.006;

fn default_hmin() -> f64 {
    -DEFAULT_HALF_APERTURE_H
}

fn default_hmax() -> f64 {
    DEFAULT_HALF_APERTURE_H
}

fn default_vmin() -> f64 {
    -DEFAULT_HALF_APERTURE_V
}

fn default_vmax() -> f64 {
    DEFAULT_HALF_APERTURE_V
}

impl Element {
    /// Creates an aligned element with the default chamber.
    pub fn new(family: impl Into<String>, kind: ElementKind, length: f64) -> Self {
        Self {
            family: family.into(),
            kind,
            length,
            hmin: default_hmin(),
            hmax: default_hmax(),
            vmin: default_vmin(),
            vmax: default_vmax(),
            dx: 0.0,
            dy: 0.0,
            roll: 0.0,
        }
    }

    /// Zero-length marker.
    pub fn marker(family: impl Into<String>) -> Self {
        Self::new(family, ElementKind::Marker, 0.0)
    }

    /// Zero-length beam position monitor.
    pub fn bpm(family: impl Into<String>) -> Self {
        Self::new(family, ElementKind::Bpm, 0.0)
    }

    /// Drift of `length` metres.
    pub fn drift(family: impl Into<String>, length: f64) -> Self {
        Self::new(family, ElementKind::Drift, length)
    }

    /// Thick quadrupole.
    pub fn quadrupole(family: impl Into<String>, length: f64, k: f64) -> Self {
        Self::new(family, ElementKind::Quadrupole { k }, length)
    }

    /// Sector dipole.
    pub fn dipole(family: impl Into<String>, length: f64, angle: f64) -> Self {
        Self::new(family, ElementKind::Dipole { angle }, length)
    }

    /// Thin orbit corrector.
    pub fn corrector(family: impl Into<String>) -> Self {
        Self::new(
            family,
            ElementKind::Corrector {
                hkick: 0.0,
                vkick: 0.0,
            },
            0.0,
        )
    }

    /// Pulsed kicker, initially off.
    pub fn kicker(family: impl Into<String>, length: f64) -> Self {
        Self::new(family, ElementKind::Kicker { angle: 0.0 }, length)
    }

    /// RF cavity.
    pub fn cavity(family: impl Into<String>, voltage: f64, frequency: f64) -> Self {
        Self::new(family, ElementKind::Cavity { voltage, frequency }, 0.0)
    }

    /// Replaces the chamber with a symmetric one.
    pub fn with_aperture(mut self, half_h: f64, half_v: f64) -> Self {
        self.hmin = -half_h;
        self.hmax = half_h;
        self.vmin = -half_v;
        self.vmax = half_v;
        self
    }

    /// Bending angle, zero for anything but dipoles.
    pub fn bending_angle(&self) -> f64 {
        match self.kind {
            ElementKind::Dipole { angle } => angle,
            _ => 0.0,
        }
    }

    /// Returns `true` when `(x, y)` lies inside the chamber.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.hmin && x <= self.hmax && y >= self.vmin && y <= self.vmax
    }
}

/// Vacuum-chamber limits sampled along a lattice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Apertures {
    /// Lower horizontal limits [m].
    pub hmin: Vec<f64>,
    /// Upper horizontal limits [m].
    pub hmax: Vec<f64>,
    /// Lower vertical limits [m].
    pub vmin: Vec<f64>,
    /// Upper vertical limits [m].
    pub vmax: Vec<f64>,
}

impl Apertures {
    /// Number of samples; all four arrays must agree.
    pub fn len(&self) -> Result<usize, VaError> {
        let len = self.hmin.len();
        if self.hmax.len() != len || self.vmin.len() != len || self.vmax.len() != len {
            return Err(VaError::Config(
                ErrorInfo::new("aperture-shape", "aperture arrays have different lengths")
                    .with_context("hmin", self.hmin.len().to_string())
                    .with_context("hmax", self.hmax.len().to_string())
                    .with_context("vmin", self.vmin.len().to_string())
                    .with_context("vmax", self.vmax.len().to_string()),
            ));
        }
        Ok(len)
    }

    /// Uniform symmetric chamber with `len` samples.
    pub fn uniform(len: usize, half_h: f64, half_v: f64) -> Self {
        Self {
            hmin: vec![-half_h; len],
            hmax: vec![half_h; len],
            vmin: vec![-half_v; len],
            vmax: vec![half_v; len],
        }
    }

    /// Returns `true` when the arrays hold no samples.
    pub fn is_empty(&self) -> bool {
        self.hmin.is_empty()
    }
}

/// Ordered element list with the beam energy it is designed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    /// Beam energy [eV].
    pub energy: f64,
    /// RF harmonic number (number of bunch slots); zero for lines.
    #[serde(default)]
    pub harmonic_number: usize,
    /// Elements in beam order.
    pub elements: Vec<Element>,
}

impl Lattice {
    /// Creates a lattice.
    pub fn new(energy: f64, harmonic_number: usize, elements: Vec<Element>) -> Self {
        Self {
            energy,
            harmonic_number,
            elements,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` for an empty lattice.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Total length [m].
    pub fn length(&self) -> f64 {
        self.elements.iter().map(|e| e.length).sum()
    }

    /// Revolution period of an ultra-relativistic beam [s].
    pub fn revolution_period(&self) -> f64 {
        self.length() / LIGHT_SPEED
    }

    /// Longitudinal position at the entrance of every element plus the end point.
    pub fn spos(&self) -> Vec<f64> {
        let mut positions = Vec::with_capacity(self.elements.len() + 1);
        let mut s = 0.0;
        positions.push(s);
        for element in &self.elements {
            s += element.length;
            positions.push(s);
        }
        positions
    }

    /// Indices of every element of `family`.
    pub fn family_indices(&self, family: &str) -> Vec<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.family == family)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Index of the first element of `family`.
    pub fn first_index(&self, family: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.family == family)
    }

    /// Sub-line covering `range`.
    pub fn segment(&self, range: Range<usize>) -> Lattice {
        let end = range.end.min(self.elements.len());
        let start = range.start.min(end);
        Lattice {
            energy: self.energy,
            harmonic_number: 0,
            elements: self.elements[start..end].to_vec(),
        }
    }

    /// Ring reordered so that it starts at element `start`.
    pub fn rotated(&self, start: usize) -> Lattice {
        let mut elements = self.elements.clone();
        if !elements.is_empty() {
            elements.rotate_left(start % self.elements.len());
        }
        Lattice {
            energy: self.energy,
            harmonic_number: self.harmonic_number,
            elements,
        }
    }

    /// Chamber limits of every element.
    pub fn apertures(&self) -> Apertures {
        Apertures {
            hmin: self.elements.iter().map(|e| e.hmin).collect(),
            hmax: self.elements.iter().map(|e| e.hmax).collect(),
            vmin: self.elements.iter().map(|e| e.vmin).collect(),
            vmax: self.elements.iter().map(|e| e.vmax).collect(),
        }
    }

    /// Sum of the cavity voltages [V].
    pub fn rf_voltage(&self) -> f64 {
        self.elements
            .iter()
            .map(|e| match e.kind {
                ElementKind::Cavity { voltage, .. } => voltage,
                _ => 0.0,
            })
            .sum()
    }

    /// Frequency of the first cavity [Hz].
    pub fn rf_frequency(&self) -> Option<f64> {
        self.elements.iter().find_map(|e| match e.kind {
            ElementKind::Cavity { frequency, .. } => Some(frequency),
            _ => None,
        })
    }

    /// Returns `true` when the lattice contains at least one dipole.
    pub fn has_dipoles(&self) -> bool {
        self.elements
            .iter()
            .any(|e| matches!(e.kind, ElementKind::Dipole { .. }))
    }
}

/// Compact lattice recipe: `head`, then `cell` repeated `cells` times, then `tail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeLayout {
    /// Beam energy [eV].
    pub energy: f64,
    /// RF harmonic number; zero for lines.
    #[serde(default)]
    pub harmonic_number: usize,
    /// Elements placed before the periodic part.
    #[serde(default)]
    pub head: Vec<Element>,
    /// Periodic cell.
    #[serde(default)]
    pub cell: Vec<Element>,
    /// Number of cell repetitions.
    #[serde(default = "default_cells")]
    pub cells: usize,
    /// Elements placed after the periodic part.
    #[serde(default)]
    pub tail: Vec<Element>,
}

fn default_cells() -> usize {
    1
}

/// Lengths must be finite and non-negative; a bend needs a body to bend in.
fn check_element(element: &Element) -> Result<(), VaError> {
    let length = element.length;
    let bad = if !(length.is_finite() && length >= 0.0) {
        Some("element length must be finite and non-negative")
    } else if element.bending_angle() != 0.0 && length == 0.0 {
        Some("a dipole with a bending angle needs a positive length")
    } else {
        None
    };
    match bad {
        Some(message) => Err(VaError::Config(
            ErrorInfo::new("element-length", message)
                .with_context("family", element.family.clone())
                .with_context("length", length.to_string()),
        )),
        None => Ok(()),
    }
}

impl LatticeLayout {
    /// Expands the recipe into a lattice.
    pub fn build(&self) -> Result<Lattice, VaError> {
        if !(self.energy.is_finite() && self.energy > 0.0) {
            return Err(VaError::Config(
                ErrorInfo::new("lattice-energy", "lattice energy must be positive")
                    .with_context("energy", self.energy.to_string()),
            ));
        }
        for element in self.head.iter().chain(&self.cell).chain(&self.tail) {
            check_element(element)?;
        }
        let mut elements =
            Vec::with_capacity(self.head.len() + self.cell.len() * self.cells + self.tail.len());
        elements.extend(self.head.iter().cloned());
        for _ in 0..self.cells {
            elements.extend(self.cell.iter().cloned());
        }
        elements.extend(self.tail.iter().cloned());
        Ok(Lattice::new(self.energy, self.harmonic_number, elements))
    }
}
