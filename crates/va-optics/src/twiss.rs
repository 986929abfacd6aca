//! Twiss parameters and tables.

use serde::{Deserialize, Serialize};

/// Six-dimensional phase-space point `(x, px, y, py, δ, dl)`.
pub type PhaseSpace = [f64; 6];

/// Optical functions and closed orbit at one location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Twiss {
    /// Longitudinal position [m].
    #[serde(default)]
    pub spos: f64,
    /// Horizontal beta [m].
    pub betax: f64,
    /// Horizontal alpha.
    #[serde(default)]
    pub alphax: f64,
    /// Horizontal phase advance [rad].
    #[serde(default)]
    pub mux: f64,
    /// Vertical beta [m].
    pub betay: f64,
    /// Vertical alpha.
    #[serde(default)]
    pub alphay: f64,
    /// Vertical phase advance [rad].
    #[serde(default)]
    pub muy: f64,
    /// Horizontal dispersion [m].
    #[serde(default)]
    pub etax: f64,
    /// Horizontal dispersion derivative.
    #[serde(default)]
    pub etapx: f64,
    /// Vertical dispersion [m].
    #[serde(default)]
    pub etay: f64,
    /// Vertical dispersion derivative.
    #[serde(default)]
    pub etapy: f64,
    /// Closed orbit or beam centroid.
    #[serde(default)]
    pub co: PhaseSpace,
}

impl Default for Twiss {
    fn default() -> Self {
        Self {
            spos: 0.0,
            betax: 1.0,
            alphax: 0.0,
            mux: 0.0,
            betay: 1.0,
            alphay: 0.0,
            muy: 0.0,
            etax: 0.0,
            etapx: 0.0,
            etay: 0.0,
            etapy: 0.0,
            co: [0.0; 6],
        }
    }
}

impl Twiss {
    /// Uncoupled Twiss with the given betas, zero alpha and no dispersion.
    pub fn with_betas(betax: f64, betay: f64) -> Self {
        Self {
            betax,
            betay,
            ..Self::default()
        }
    }

    /// Horizontal gamma `(1 + α²)/β`.
    pub fn gammax(&self) -> f64 {
        (1.0 + self.alphax * self.alphax) / self.betax
    }

    /// Vertical gamma `(1 + α²)/β`.
    pub fn gammay(&self) -> f64 {
        (1.0 + self.alphay * self.alphay) / self.betay
    }

    /// Horizontal dispersion invariant `H = γη² + 2αηη' + βη'²`.
    pub fn curly_h(&self) -> f64 {
        self.gammax() * self.etax * self.etax
            + 2.0 * self.alphax * self.etax * self.etapx
            + self.betax * self.etapx * self.etapx
    }
}

/// Twiss parameters at the entrance of every element plus the end point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwissTable {
    /// Samples in beam order.
    pub points: Vec<Twiss>,
}

impl TwissTable {
    /// Wraps a list of samples.
    pub fn new(points: Vec<Twiss>) -> Self {
        Self { points }
    }

    /// Single-point table.
    pub fn single(twiss: Twiss) -> Self {
        Self {
            points: vec![twiss],
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns `true` when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sample at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Twiss> {
        self.points.get(idx)
    }

    /// Last sample.
    pub fn last(&self) -> Option<&Twiss> {
        self.points.last()
    }

    /// Horizontal betas.
    pub fn betax(&self) -> Vec<f64> {
        self.points.iter().map(|t| t.betax).collect()
    }

    /// Vertical betas.
    pub fn betay(&self) -> Vec<f64> {
        self.points.iter().map(|t| t.betay).collect()
    }

    /// Closed-orbit samples.
    pub fn orbit(&self) -> Vec<PhaseSpace> {
        self.points.iter().map(|t| t.co).collect()
    }

    /// First `len` samples.
    pub fn truncated(&self, len: usize) -> TwissTable {
        TwissTable {
            points: self.points.iter().take(len).copied().collect(),
        }
    }

    /// Length-weighted average horizontal and vertical beta.
    pub fn average_betas(&self) -> (f64, f64) {
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut total = 0.0;
        for pair in self.points.windows(2) {
            let ds = pair[1].spos - pair[0].spos;
            sum_x += 0.5 * (pair[0].betax + pair[1].betax) * ds;
            sum_y += 0.5 * (pair[0].betay + pair[1].betay) * ds;
            total += ds;
        }
        if total > 0.0 {
            (sum_x / total, sum_y / total)
        } else {
            match self.points.first() {
                Some(t) => (t.betax, t.betay),
                None => (0.0, 0.0),
            }
        }
    }
}
