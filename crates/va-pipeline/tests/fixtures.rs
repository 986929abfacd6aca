#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use va_core::{Clock, ManualClock, PvValue, VaError};
use va_optics::{
    EquilibriumSummary, Lattice, LatticeLifetimes, LifetimeInputs, LinearOptics, OpticsEngine,
    PhaseSpace, Twiss, TwissBoundary, TwissTable,
};
use va_pipeline::{Orchestrator, PvReader};
use va_stage::MachineConfig;

/// Closed orbit reported by [`IdealEngine`] at every element.
pub const ORBIT: PhaseSpace = [1.0e-6, 0.0, -2.0e-6, 0.0, 0.0, 0.0];
/// Tunes reported by [`IdealEngine`] for periodic optics.
pub const TUNES: [f64; 2] = [0.2, 0.3];
/// Lifetime of every mechanism reported by [`IdealEngine`] [s].
pub const LIFETIME: f64 = 36_000.0;

/// Engine returning fixed, well-behaved optics for any lattice.
pub struct IdealEngine;

fn table(lattice: &Lattice) -> TwissTable {
    let mut point = Twiss::with_betas(5.0, 5.0);
    point.co = ORBIT;
    TwissTable::new(vec![point; lattice.len() + 1])
}

impl OpticsEngine for IdealEngine {
    fn find_closed_orbit(&self, lattice: &Lattice) -> Result<Vec<PhaseSpace>, VaError> {
        Ok(vec![ORBIT; lattice.len() + 1])
    }

    fn compute_twiss_and_transfer_matrix(
        &self,
        lattice: &Lattice,
        boundary: TwissBoundary<'_>,
    ) -> Result<LinearOptics, VaError> {
        let tunes = match boundary {
            TwissBoundary::Periodic(_) => Some(TUNES),
            TwissBoundary::Seed(_) => None,
        };
        Ok(LinearOptics {
            twiss: table(lattice),
            transfer_matrix: nalgebra::Matrix6::identity(),
            tunes,
        })
    }

    fn compute_equilibrium_parameters(
        &self,
        lattice: &Lattice,
        _twiss: &TwissTable,
    ) -> Result<EquilibriumSummary, VaError> {
        Ok(EquilibriumSummary {
            energy: lattice.energy,
            revolution_period: lattice.revolution_period(),
            emittance: 2.0e-9,
            energy_spread: 8.0e-4,
            momentum_compaction: 1.7e-4,
            energy_loss_per_turn: 1.0e5,
            damping_times: [0.01, 0.01, 0.005],
            synchrotron_tune: 0.004,
            energy_acceptance: 0.03,
        })
    }

    fn compute_lifetimes_from_lattice(
        &self,
        _lattice: &Lattice,
        _twiss: &TwissTable,
        _equilibrium: &EquilibriumSummary,
        _inputs: &LifetimeInputs,
    ) -> Result<LatticeLifetimes, VaError> {
        Ok(LatticeLifetimes {
            elastic: LIFETIME,
            inelastic: LIFETIME,
            quantum: f64::INFINITY,
        })
    }

    fn track_particles_through_line(
        &self,
        lattice: &Lattice,
        particles: &[PhaseSpace],
    ) -> Result<Vec<Vec<PhaseSpace>>, VaError> {
        Ok(particles
            .iter()
            .map(|particle| vec![*particle; lattice.len() + 1])
            .collect())
    }
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

/// Boxed [`IdealEngine`], as the machine builders expect.
pub fn ideal() -> Box<dyn OpticsEngine> {
    Box::new(IdealEngine)
}

/// Boxed [`FailingEngine`].
pub fn failing() -> Box<dyn OpticsEngine> {
    Box::new(FailingEngine)
}

/// Manual clock at t = 0 and its shared handle.
pub fn clock() -> (ManualClock, Arc<dyn Clock>) {
    let clock = ManualClock::starting_at(0.0);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (clock, shared)
}

/// Default machine on [`IdealEngine`].
pub fn orchestrator() -> Orchestrator {
    let (_, shared) = clock();
    Orchestrator::from_machine(&MachineConfig::default(), ideal, shared).expect("orchestrator")
}

/// Scalar of a PV value, panicking on arrays.
pub fn scalar(value: Option<PvValue>) -> f64 {
    match value.expect("pv value") {
        PvValue::Scalar(value) => value,
        PvValue::Array(values) => panic!("expected a scalar, got {values:?}"),
    }
}

/// Polls `reader` until `done` holds or `timeout` elapses.
pub fn wait_for(reader: &PvReader, timeout: Duration, done: impl Fn(&PvReader) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(reader) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done(reader)
}
