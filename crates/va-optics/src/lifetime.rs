//! Gas scattering and quantum lifetime estimates.

use va_core::units::{
    BOLTZMANN, CLASSICAL_ELECTRON_RADIUS, ELECTRON_REST_ENERGY_EV, FINE_STRUCTURE, LIGHT_SPEED,
};

use crate::engine::LifetimeInputs;
use crate::lattice::Lattice;
use crate::twiss::TwissTable;

/// Exponent above which the quantum lifetime is treated as infinite.
const QUANTUM_EXPONENT_CUTOFF: f64 = 700.0;

/// Number density of gas atoms [1/m³].
pub fn gas_density(inputs: &LifetimeInputs) -> f64 {
    inputs.atoms_per_molecule * inputs.pressure / (BOLTZMANN * inputs.temperature)
}

/// Transverse acceptances `min(a²/β)` about the closed orbit, `(Ax, Ay)` [m·rad].
pub fn transverse_acceptances(lattice: &Lattice, twiss: &TwissTable) -> (f64, f64) {
    let mut ax = f64::INFINITY;
    let mut ay = f64::INFINITY;
    for (element, point) in lattice.elements.iter().zip(&twiss.points) {
        let x = point.co[0];
        let y = point.co[2];
        let half_h = (element.hmax - x).min(x - element.hmin).max(0.0);
        let half_v = (element.vmax - y).min(y - element.vmin).max(0.0);
        ax = ax.min(half_h * half_h / point.betax);
        ay = ay.min(half_v * half_v / point.betay);
    }
    (ax, ay)
}

/// Elastic (Coulomb) gas scattering lifetime [s].
pub fn elastic_lifetime(
    energy: f64,
    inputs: &LifetimeInputs,
    average_betas: (f64, f64),
    acceptances: (f64, f64),
) -> f64 {
    let gamma = energy / ELECTRON_REST_ENERGY_EV;
    let z = inputs.atomic_number;
    let prefactor = 2.0
        * std::f64::consts::PI
        * CLASSICAL_ELECTRON_RADIUS.powi(2)
        * LIGHT_SPEED
        * gas_density(inputs)
        * z
        * z
        / (gamma * gamma);
    let rate = prefactor * (average_betas.0 / acceptances.0 + average_betas.1 / acceptances.1);
    invert_rate(rate)
}

/// Inelastic (bremsstrahlung) gas scattering lifetime for a relative energy acceptance [s].
pub fn inelastic_lifetime(inputs: &LifetimeInputs, energy_acceptance: f64) -> f64 {
    if !(energy_acceptance > 0.0 && energy_acceptance < 1.0) {
        return f64::INFINITY;
    }
    let z = inputs.atomic_number;
    let rate = 4.0
        * CLASSICAL_ELECTRON_RADIUS.powi(2)
        * FINE_STRUCTURE
        * gas_density(inputs)
        * LIGHT_SPEED
        * z
        * z
        * (183.0 * z.powf(-1.0 / 3.0)).ln()
        * (4.0 / 3.0)
        * ((1.0 / energy_acceptance).ln() - 5.0 / 8.0);
    invert_rate(rate)
}

/// Quantum lifetime of one plane, `τd/2 · e^ξ/ξ` with `ξ = A/(2ε)` [s].
pub fn quantum_lifetime(acceptance: f64, emittance: f64, damping_time: f64) -> f64 {
    if emittance <= 0.0 {
        return f64::INFINITY;
    }
    let xi = acceptance / (2.0 * emittance);
    if xi > QUANTUM_EXPONENT_CUTOFF {
        return f64::INFINITY;
    }
    if xi <= 0.0 {
        return 0.0;
    }
    0.5 * damping_time * xi.exp() / xi
}

fn invert_rate(rate: f64) -> f64 {
    if rate > 0.0 {
        rate.recip()
    } else {
        f64::INFINITY
    }
}
