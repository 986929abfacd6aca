//! Charge-loss fractions of transport lines and rings.
//!
//! Both estimates compare the beam envelope (or, for rings, the acceptance
//! emittance along the injected trajectory) with the vacuum chamber. Any
//! failure of the optics engine counts as total loss.

use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};
use statrs::function::erf::erf;
use tracing::debug;
use va_core::{ErrorInfo, VaError};

use crate::engine::{OpticsEngine, TwissBoundary};
use crate::lattice::{Apertures, Lattice};
use crate::twiss::{PhaseSpace, Twiss, TwissTable};

/// Apertures beyond this magnitude are treated as open.
pub const APERTURE_CLAMP: f64 = 1e100;
/// Number of energy-offset samples in the ring integration.
pub const ENERGY_SAMPLES: usize = 21;
/// Energy offsets span `±ENERGY_SPAN_SIGMAS · σδ`.
pub const ENERGY_SPAN_SIGMAS: f64 = 3.0;

/// Position and angle of the local frame relative to the upstream one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinateOffset {
    /// Horizontal displacement [m].
    #[serde(default)]
    pub delta_rx: f64,
    /// Horizontal angle [rad].
    #[serde(default)]
    pub delta_angle: f64,
}

/// Beam description handed from one stage to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyParameters {
    /// Total emittance [m·rad].
    pub emittance: f64,
    /// Relative energy spread.
    pub energy_spread: f64,
    /// Global coupling `εy/εx`.
    pub global_coupling: f64,
    /// Twiss (and centroid) at the entrance of the downstream lattice.
    pub init_twiss: Twiss,
    /// Chamber override; the lattice's own chamber is used when absent.
    #[serde(default)]
    pub apertures: Option<Apertures>,
    /// Frame change applied to the centroid before propagation.
    #[serde(default)]
    pub coordinate_offset: CoordinateOffset,
}

impl EfficiencyParameters {
    /// Creates a bundle with no chamber override and no frame change.
    pub fn new(emittance: f64, energy_spread: f64, global_coupling: f64, init_twiss: Twiss) -> Self {
        Self {
            emittance,
            energy_spread,
            global_coupling,
            init_twiss,
            apertures: None,
            coordinate_offset: CoordinateOffset::default(),
        }
    }

    /// Sets the chamber override.
    pub fn with_apertures(mut self, apertures: Apertures) -> Self {
        self.apertures = Some(apertures);
        self
    }

    /// Sets the frame change.
    pub fn with_offset(mut self, offset: CoordinateOffset) -> Self {
        self.coordinate_offset = offset;
        self
    }

    /// Initial Twiss with the centroid expressed in the local frame.
    pub fn local_seed(&self) -> Twiss {
        let mut seed = self.init_twiss;
        seed.co = transform_to_local_coordinates(
            seed.co,
            self.coordinate_offset.delta_rx,
            self.coordinate_offset.delta_angle,
        );
        seed
    }

    fn split_emittance(&self) -> (f64, f64) {
        let coupling = self.global_coupling;
        (
            self.emittance / (1.0 + coupling),
            self.emittance * coupling / (1.0 + coupling),
        )
    }
}

/// Rotates the centroid by `delta_angle` in the `(x, dl)` plane and shifts it by `delta_rx`.
pub fn transform_to_local_coordinates(
    position: PhaseSpace,
    delta_rx: f64,
    delta_angle: f64,
) -> PhaseSpace {
    let (s, c) = delta_angle.sin_cos();
    let mut local = position;
    local[0] = c * position[0] + s * position[5] + delta_rx;
    local[5] = -s * position[0] + c * position[5];
    local[1] = (delta_angle + position[1].atan()).tan();
    local
}

/// Result of [`loss_fraction_in_line`].
#[derive(Debug, Clone, PartialEq)]
pub struct LineLoss {
    /// Fraction of charge lost, in `[0, 1]`.
    pub loss_fraction: f64,
    /// Twiss along the line; absent when the optics failed.
    pub twiss: Option<TwissTable>,
    /// Line transfer matrix; absent for empty lines and failed optics.
    pub transfer_matrix: Option<Matrix6<f64>>,
}

impl LineLoss {
    fn total() -> Self {
        Self {
            loss_fraction: 1.0,
            twiss: None,
            transfer_matrix: None,
        }
    }

    /// Surviving fraction `1 − loss`.
    pub fn efficiency(&self) -> f64 {
        1.0 - self.loss_fraction
    }
}

fn aperture_samples(lattice: &Lattice, apertures: &Apertures) -> Result<usize, VaError> {
    let samples = apertures.len()?;
    if samples == lattice.len() || samples == lattice.len() + 1 {
        Ok(samples)
    } else {
        Err(VaError::Config(
            ErrorInfo::new("aperture-mismatch", "vacuum chamber does not match the lattice")
                .with_context("elements", lattice.len().to_string())
                .with_context("apertures", samples.to_string())
                .with_hint("provide one sample per element, or one per element plus the end"),
        ))
    }
}

fn clamped(apertures: &Apertures, idx: usize) -> (f64, f64, f64, f64) {
    (
        apertures.hmin[idx].max(-APERTURE_CLAMP),
        apertures.hmax[idx].min(APERTURE_CLAMP),
        apertures.vmin[idx].max(-APERTURE_CLAMP),
        apertures.vmax[idx].min(APERTURE_CLAMP),
    )
}

/// Clearance to one chamber wall: negative clearances and clearances wider than
/// the chamber count as zero.
fn clearance(distance: f64, chamber: f64) -> f64 {
    if distance < 0.0 || distance > chamber {
        0.0
    } else {
        distance
    }
}

/// Fraction of charge lost while traversing `line`.
pub fn loss_fraction_in_line(
    engine: &dyn OpticsEngine,
    line: &Lattice,
    params: &EfficiencyParameters,
) -> Result<LineLoss, VaError> {
    let seed = params.local_seed();
    if line.is_empty() {
        return Ok(LineLoss {
            loss_fraction: 0.0,
            twiss: Some(TwissTable::single(seed)),
            transfer_matrix: None,
        });
    }
    let apertures = params.apertures.clone().unwrap_or_else(|| line.apertures());
    let samples = aperture_samples(line, &apertures)?;

    let optics = match engine.compute_twiss_and_transfer_matrix(line, TwissBoundary::Seed(seed)) {
        Ok(optics) => optics,
        Err(err) => {
            debug!(error = %err, "line optics failed, counting total loss");
            return Ok(LineLoss::total());
        }
    };
    if optics.twiss.last().map_or(true, |t| t.betax.is_nan()) {
        return Ok(LineLoss::total());
    }

    let (emit_x, emit_y) = params.split_emittance();
    let spread = params.energy_spread;
    let mut min_x_inf = f64::INFINITY;
    let mut min_x_sup = f64::INFINITY;
    let mut min_y_inf = f64::INFINITY;
    let mut min_y_sup = f64::INFINITY;
    for (idx, point) in optics.twiss.points.iter().take(samples).enumerate() {
        let sigma_x = (point.betax * emit_x + (point.etax * spread).powi(2)).sqrt();
        let sigma_y = (point.betay * emit_y + (point.etay * spread).powi(2)).sqrt();
        let (hmin, hmax, vmin, vmax) = clamped(&apertures, idx);
        let (rx, ry) = (point.co[0], point.co[2]);
        min_x_inf = min_x_inf.min(clearance(rx - hmin, hmax - hmin) / sigma_x);
        min_x_sup = min_x_sup.min(clearance(hmax - rx, hmax - hmin) / sigma_x);
        min_y_inf = min_y_inf.min(clearance(ry - vmin, vmax - vmin) / sigma_y);
        min_y_sup = min_y_sup.min(clearance(vmax - ry, vmax - vmin) / sigma_y);
    }

    let sqrt2 = std::f64::consts::SQRT_2;
    let survival_x = 0.5 * erf(min_x_inf / sqrt2) + 0.5 * erf(min_x_sup / sqrt2);
    let survival_y = 0.5 * erf(min_y_inf / sqrt2) + 0.5 * erf(min_y_sup / sqrt2);
    let loss_fraction = (1.0 - survival_x * survival_y).clamp(0.0, 1.0);
    Ok(LineLoss {
        loss_fraction,
        twiss: Some(optics.twiss),
        transfer_matrix: Some(optics.transfer_matrix),
    })
}

/// Fraction of injected charge lost in `ring`, integrated over the energy distribution.
pub fn loss_fraction_in_ring(
    engine: &dyn OpticsEngine,
    ring: &Lattice,
    params: &EfficiencyParameters,
) -> Result<f64, VaError> {
    let seed = params.local_seed();
    let apertures = params.apertures.clone().unwrap_or_else(|| ring.apertures());
    let samples = aperture_samples(ring, &apertures)?;

    let twiss = match engine.compute_twiss_and_transfer_matrix(ring, TwissBoundary::Seed(seed)) {
        Ok(optics) => optics.twiss,
        Err(err) => {
            debug!(error = %err, "injection optics failed, counting total loss");
            return Ok(1.0);
        }
    };
    if twiss.last().map_or(true, |t| t.betax.is_nan()) {
        return Ok(1.0);
    }

    let spread = params.energy_spread;
    let emittance = params.emittance;
    let offsets: Vec<f64> = (0..ENERGY_SAMPLES)
        .map(|i| {
            let span = 2.0 * ENERGY_SPAN_SIGMAS * spread;
            -ENERGY_SPAN_SIGMAS * spread + span * i as f64 / (ENERGY_SAMPLES - 1) as f64
        })
        .collect();

    // a vanishing spread leaves a single on-momentum sample, weighted uniformly
    let density = Normal::new(0.0, spread).ok();
    let mut weight_sum = 0.0;
    let mut total_loss = 0.0;
    for offset in offsets {
        let weight = density.as_ref().map_or(1.0, |normal| normal.pdf(offset));
        weight_sum += weight;

        let mut particle = seed.co;
        particle[4] += offset;
        let track = match engine.track_particles_through_line(ring, &[particle]) {
            Ok(mut tracks) => tracks.pop().unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, offset, "tracking failed, counting total loss");
                total_loss += weight;
                continue;
            }
        };
        if track.last().map_or(true, |p| p[0].is_nan()) {
            total_loss += weight;
            continue;
        }

        let mut emit_x_min = f64::INFINITY;
        let mut emit_y_min = f64::INFINITY;
        for idx in 0..samples.min(track.len()).min(twiss.len()) {
            let (hmin, hmax, vmin, vmax) = clamped(&apertures, idx);
            let point = &twiss.points[idx];
            let (rx, ry) = (track[idx][0], track[idx][2]);
            let disp_x = (point.etax * spread).powi(2);
            let disp_y = (point.etay * spread).powi(2);
            let acceptance = |limit: f64, dispersion: f64, beta: f64| {
                ((limit.max(0.0).powi(2) - dispersion) / beta).max(0.0)
            };
            emit_x_min = emit_x_min
                .min(acceptance(rx - hmin, disp_x, point.betax))
                .min(acceptance(hmax - rx, disp_x, point.betax));
            emit_y_min = emit_y_min
                .min(acceptance(ry - vmin, disp_y, point.betay))
                .min(acceptance(vmax - ry, disp_y, point.betay));
        }
        let min_emit = if emit_x_min * emit_y_min != 0.0 {
            emit_x_min + emit_y_min
        } else {
            0.0
        };
        let sample_loss = (-min_emit / emittance).exp().min(1.0);
        total_loss += weight * sample_loss;
    }

    let loss = if weight_sum > 0.0 {
        total_loss / weight_sum
    } else {
        1.0
    };
    Ok(loss.clamp(0.0, 1.0))
}
