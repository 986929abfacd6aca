//! Optics engine collaborator.
//!
//! Every numerical procedure the stages need from accelerator physics goes
//! through [`OpticsEngine`]. Failures are reported in the `Numerical` error
//! family; stages translate them into a beam dump.

use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};
use va_core::VaError;

use crate::lattice::Lattice;
use crate::twiss::{PhaseSpace, Twiss, TwissTable};

/// Error code: the closed-orbit search failed or the orbit hits the chamber.
pub const NO_CLOSED_ORBIT: &str = "no-closed-orbit";
/// Error code: the one-turn map has no periodic solution.
pub const UNSTABLE_OPTICS: &str = "unstable-optics";
/// Error code: a linear system could not be solved.
pub const SINGULAR_MATRIX: &str = "singular-matrix";
/// Error code: radiation equilibrium does not exist.
pub const EQUILIBRIUM_UNDEFINED: &str = "equilibrium-undefined";
/// Error code: tracking produced non-finite coordinates.
pub const TRACKING_DIVERGED: &str = "tracking-diverged";

/// Boundary condition for a Twiss computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TwissBoundary<'a> {
    /// Periodic solution about a known closed orbit (rings).
    Periodic(&'a [PhaseSpace]),
    /// Propagation from an initial condition (lines, injection trajectories).
    Seed(Twiss),
}

/// Linear optics of a lattice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearOptics {
    /// Twiss at every element entrance plus the end.
    pub twiss: TwissTable,
    /// Transfer matrix over the whole lattice (one-turn matrix for rings).
    pub transfer_matrix: Matrix6<f64>,
    /// Fractional betatron tunes, present for periodic solutions.
    pub tunes: Option<[f64; 2]>,
}

/// Radiation equilibrium of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumSummary {
    /// Beam energy [eV].
    pub energy: f64,
    /// Revolution period [s].
    pub revolution_period: f64,
    /// Natural emittance [m·rad].
    pub emittance: f64,
    /// Relative energy spread.
    pub energy_spread: f64,
    /// Momentum compaction factor.
    pub momentum_compaction: f64,
    /// Energy loss per turn [eV].
    pub energy_loss_per_turn: f64,
    /// Damping times `(x, y, e)` [s].
    pub damping_times: [f64; 3],
    /// Synchrotron tune.
    pub synchrotron_tune: f64,
    /// RF bucket half-height (relative energy acceptance).
    pub energy_acceptance: f64,
}

/// Inputs of [`OpticsEngine::compute_lifetimes_from_lattice`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LifetimeInputs {
    /// Residual gas pressure [Pa].
    pub pressure: f64,
    /// Effective atomic number of the residual gas.
    pub atomic_number: f64,
    /// Atoms per gas molecule.
    pub atoms_per_molecule: f64,
    /// Gas temperature [K].
    pub temperature: f64,
    /// Global coupling used to split the emittance between planes.
    pub coupling: f64,
}

impl Default for LifetimeInputs {
    fn default() -> Self {
        Self {
            pressure: 1.0e-7,
            atomic_number: 7.0,
            atoms_per_molecule: 2.0,
            temperature: 300.0,
            coupling: 0.01,
        }
    }
}

/// Lifetimes derived from the lattice [s].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatticeLifetimes {
    /// Elastic gas scattering.
    pub elastic: f64,
    /// Inelastic (bremsstrahlung) gas scattering.
    pub inelastic: f64,
    /// Quantum excitation.
    pub quantum: f64,
}

/// Accelerator-physics procedures consumed by the stages.
pub trait OpticsEngine: Send {
    /// Closed orbit at every element entrance plus the end (`N + 1` points).
    fn find_closed_orbit(&self, lattice: &Lattice) -> Result<Vec<PhaseSpace>, VaError>;

    /// Twiss table and transfer matrix under `boundary`.
    fn compute_twiss_and_transfer_matrix(
        &self,
        lattice: &Lattice,
        boundary: TwissBoundary<'_>,
    ) -> Result<LinearOptics, VaError>;

    /// Radiation equilibrium of a ring with periodic `twiss`.
    fn compute_equilibrium_parameters(
        &self,
        lattice: &Lattice,
        twiss: &TwissTable,
    ) -> Result<EquilibriumSummary, VaError>;

    /// Gas and quantum lifetimes.
    fn compute_lifetimes_from_lattice(
        &self,
        lattice: &Lattice,
        twiss: &TwissTable,
        equilibrium: &EquilibriumSummary,
        inputs: &LifetimeInputs,
    ) -> Result<LatticeLifetimes, VaError>;

    /// Tracks each particle one pass; returns `N + 1` points per particle,
    /// NaN from the element where the particle was lost.
    fn track_particles_through_line(
        &self,
        lattice: &Lattice,
        particles: &[PhaseSpace],
    ) -> Result<Vec<Vec<PhaseSpace>>, VaError>;
}
