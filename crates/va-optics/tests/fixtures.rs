#![allow(dead_code)]

use std::f64::consts::PI;

use va_core::VaError;
use va_optics::{
    Element, EquilibriumSummary, Lattice, LatticeLifetimes, LifetimeInputs, LinearOptics,
    OpticsEngine, PhaseSpace, TwissBoundary, TwissTable,
};

pub const ENERGY: f64 = 3.0e9;

/// FODO ring with `cells` cells, one cavity and a corrector plus BPM per cell.
pub fn fodo_ring(cells: usize, half_aperture: f64) -> Lattice {
    let angle = 2.0 * PI / (2 * cells) as f64;
    let mut elements = vec![Element::cavity("SRFCav", 3.0e6, 499.654e6)];
    for _ in 0..cells {
        elements.extend([
            Element::quadrupole("QF", 0.2, 2.0),
            Element::drift("D", 0.5),
            Element::dipole("B", 1.0, angle),
            Element::drift("D", 0.5),
            Element::bpm("BPM"),
            Element::corrector("CH"),
            Element::quadrupole("QD", 0.2, -2.0),
            Element::drift("D", 0.5),
            Element::dipole("B", 1.0, angle),
            Element::drift("D", 0.5),
        ]);
    }
    let elements = elements
        .into_iter()
        .map(|e| e.with_aperture(half_aperture, half_aperture))
        .collect();
    Lattice::new(ENERGY, 864, elements)
}

/// Ring made of quadrupoles and drifts only.
pub fn quadrupole_ring(cells: usize) -> Lattice {
    let mut elements = vec![Element::cavity("SRFCav", 3.0e6, 499.654e6)];
    for _ in 0..cells {
        elements.extend([
            Element::quadrupole("QF", 0.2, 2.0),
            Element::drift("D", 2.0),
            Element::quadrupole("QD", 0.2, -2.0),
            Element::drift("D", 2.0),
        ]);
    }
    Lattice::new(ENERGY, 864, elements)
}

/// Ring without any focusing.
pub fn drift_ring() -> Lattice {
    Lattice::new(ENERGY, 864, vec![Element::drift("D", 10.0); 4])
}

/// Straight line of drifts and a quadrupole doublet.
pub fn line(half_h: f64, half_v: f64) -> Lattice {
    let elements = vec![
        Element::drift("D", 1.0),
        Element::quadrupole("QF", 0.2, 1.0),
        Element::drift("D", 0.5),
        Element::quadrupole("QD", 0.2, -1.0),
        Element::drift("D", 1.0),
        Element::bpm("BPM"),
    ]
    .into_iter()
    .map(|e| e.with_aperture(half_h, half_v))
    .collect();
    Lattice::new(ENERGY, 0, elements)
}

/// Engine whose every procedure fails.
pub struct FailingEngine;

impl OpticsEngine for FailingEngine {
    fn find_closed_orbit(&self, _lattice: &Lattice) -> Result<Vec<PhaseSpace>, VaError> {
        Err(VaError::numerical("no-closed-orbit", "forced failure"))
    }

    fn compute_twiss_and_transfer_matrix(
        &self,
        _lattice: &Lattice,
        _boundary: TwissBoundary<'_>,
    ) -> Result<LinearOptics, VaError> {
        Err(VaError::numerical("unstable-optics", "forced failure"))
    }

    fn compute_equilibrium_parameters(
        &self,
        _lattice: &Lattice,
        _twiss: &TwissTable,
    ) -> Result<EquilibriumSummary, VaError> {
        Err(VaError::numerical("equilibrium-undefined", "forced failure"))
    }

    fn compute_lifetimes_from_lattice(
        &self,
        _lattice: &Lattice,
        _twiss: &TwissTable,
        _equilibrium: &EquilibriumSummary,
        _inputs: &LifetimeInputs,
    ) -> Result<LatticeLifetimes, VaError> {
        Err(VaError::numerical("unstable-optics", "forced failure"))
    }

    fn track_particles_through_line(
        &self,
        _lattice: &Lattice,
        _particles: &[PhaseSpace],
    ) -> Result<Vec<Vec<PhaseSpace>>, VaError> {
        Err(VaError::numerical("tracking-diverged", "forced failure"))
    }
}
