//! Built-in optics engine based on first-order affine element maps.
//!
//! Every element maps `z' = M z + b` in the 6-D phase space
//! `(x, px, y, py, δ, dl)`. Misalignments and rolls are folded into `M` and
//! `b`, so a misaligned quadrupole steers the beam like it would in the real
//! machine.

use nalgebra::{Matrix2, Matrix4, Matrix6, Vector2, Vector4, Vector6};
use tracing::debug;
use va_core::units::{CGAMMA, CQ, ELECTRON_REST_ENERGY_EV, LIGHT_SPEED};
use va_core::{ErrorInfo, VaError};

use crate::engine::{
    EquilibriumSummary, LatticeLifetimes, LifetimeInputs, LinearOptics, OpticsEngine,
    TwissBoundary, EQUILIBRIUM_UNDEFINED, NO_CLOSED_ORBIT, SINGULAR_MATRIX, TRACKING_DIVERGED,
    UNSTABLE_OPTICS,
};
use crate::lattice::{Element, ElementKind, Lattice};
use crate::lifetime::{
    elastic_lifetime, inelastic_lifetime, quantum_lifetime, transverse_acceptances,
};
use crate::twiss::{PhaseSpace, Twiss, TwissTable};

const SINGULARITY_THRESHOLD: f64 = 1e-12;

/// Linear optics engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearEngine;

impl LinearEngine {
    /// Creates the engine.
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy)]
struct ElementMap {
    matrix: Matrix6<f64>,
    offset: Vector6<f64>,
}

impl ElementMap {
    fn identity() -> Self {
        Self {
            matrix: Matrix6::identity(),
            offset: Vector6::zeros(),
        }
    }

    fn apply(&self, z: &Vector6<f64>) -> Vector6<f64> {
        self.matrix * z + self.offset
    }

    fn then(&self, next: &ElementMap) -> ElementMap {
        ElementMap {
            matrix: next.matrix * self.matrix,
            offset: next.matrix * self.offset + next.offset,
        }
    }
}

fn numerical(code: &str, message: impl Into<String>) -> VaError {
    VaError::Numerical(ErrorInfo::new(code, message))
}

fn to_vector(point: &PhaseSpace) -> Vector6<f64> {
    Vector6::from_column_slice(point)
}

fn to_point(z: &Vector6<f64>) -> PhaseSpace {
    [z[0], z[1], z[2], z[3], z[4], z[5]]
}

fn is_finite(z: &Vector6<f64>) -> bool {
    z.iter().all(|v| v.is_finite())
}

/// Betatron block `[[C, S], [C', S']]` for a normalised gradient `k`.
fn betatron_block(k: f64, length: f64) -> Matrix2<f64> {
    if k > 0.0 {
        let root = k.sqrt();
        let phi = root * length;
        Matrix2::new(phi.cos(), phi.sin() / root, -root * phi.sin(), phi.cos())
    } else if k < 0.0 {
        let root = (-k).sqrt();
        let phi = root * length;
        Matrix2::new(phi.cosh(), phi.sinh() / root, root * phi.sinh(), phi.cosh())
    } else {
        Matrix2::new(1.0, length, 0.0, 1.0)
    }
}

fn set_block(matrix: &mut Matrix6<f64>, row: usize, block: &Matrix2<f64>) {
    matrix[(row, row)] = block[(0, 0)];
    matrix[(row, row + 1)] = block[(0, 1)];
    matrix[(row + 1, row)] = block[(1, 0)];
    matrix[(row + 1, row + 1)] = block[(1, 1)];
}

fn roll_matrix(angle: f64) -> Matrix6<f64> {
    let (s, c) = angle.sin_cos();
    let mut rotation = Matrix6::identity();
    for offset in 0..2 {
        rotation[(offset, offset)] = c;
        rotation[(offset, offset + 2)] = s;
        rotation[(offset + 2, offset)] = -s;
        rotation[(offset + 2, offset + 2)] = c;
    }
    rotation
}

fn element_map(element: &Element) -> ElementMap {
    let length = element.length;
    let mut matrix = Matrix6::identity();
    let mut offset = Vector6::zeros();
    match element.kind {
        ElementKind::Marker | ElementKind::Bpm => {}
        ElementKind::Drift | ElementKind::Cavity { .. } => {
            let block = betatron_block(0.0, length);
            set_block(&mut matrix, 0, &block);
            set_block(&mut matrix, 2, &block);
        }
        ElementKind::Quadrupole { k } => {
            set_block(&mut matrix, 0, &betatron_block(k, length));
            set_block(&mut matrix, 2, &betatron_block(-k, length));
        }
        ElementKind::Dipole { angle } => {
            if angle == 0.0 || length == 0.0 {
                let block = betatron_block(0.0, length);
                set_block(&mut matrix, 0, &block);
                set_block(&mut matrix, 2, &block);
            } else {
                let h = angle / length;
                let (s, c) = angle.sin_cos();
                set_block(&mut matrix, 0, &betatron_block(h * h, length));
                set_block(&mut matrix, 2, &betatron_block(0.0, length));
                matrix[(0, 4)] = (1.0 - c) / h;
                matrix[(1, 4)] = s;
                matrix[(5, 0)] = -s;
                matrix[(5, 1)] = -(1.0 - c) / h;
                matrix[(5, 4)] = -(length - s / h);
            }
        }
        ElementKind::Corrector { hkick, vkick } => {
            let block = betatron_block(0.0, length);
            set_block(&mut matrix, 0, &block);
            set_block(&mut matrix, 2, &block);
            offset[1] += hkick;
            offset[3] += vkick;
        }
        ElementKind::Kicker { angle } => {
            let block = betatron_block(0.0, length);
            set_block(&mut matrix, 0, &block);
            set_block(&mut matrix, 2, &block);
            offset[1] += angle;
        }
    }

    if element.roll != 0.0 {
        let enter = roll_matrix(element.roll);
        let exit = roll_matrix(-element.roll);
        matrix = exit * matrix * enter;
        offset = exit * offset;
    }
    if element.dx != 0.0 || element.dy != 0.0 {
        let shift = Vector6::new(element.dx, 0.0, element.dy, 0.0, 0.0, 0.0);
        offset += (Matrix6::identity() - matrix) * shift;
    }
    ElementMap { matrix, offset }
}

fn element_maps(lattice: &Lattice) -> Vec<ElementMap> {
    lattice.elements.iter().map(element_map).collect()
}

fn compose(maps: &[ElementMap]) -> ElementMap {
    maps.iter()
        .fold(ElementMap::identity(), |total, map| total.then(map))
}

fn plane_block(matrix: &Matrix6<f64>, row: usize) -> Matrix2<f64> {
    Matrix2::new(
        matrix[(row, row)],
        matrix[(row, row + 1)],
        matrix[(row + 1, row)],
        matrix[(row + 1, row + 1)],
    )
}

fn dispersion_column(matrix: &Matrix6<f64>, row: usize) -> Vector2<f64> {
    Vector2::new(matrix[(row, 4)], matrix[(row + 1, 4)])
}

/// Periodic `(β, α)` of one plane.
fn periodic_plane(block: &Matrix2<f64>, plane: &str) -> Result<(f64, f64), VaError> {
    let cos_mu = 0.5 * (block[(0, 0)] + block[(1, 1)]);
    if !(cos_mu.abs() < 1.0) {
        return Err(VaError::Numerical(
            ErrorInfo::new(UNSTABLE_OPTICS, "one-turn map has no periodic solution")
                .with_context("plane", plane)
                .with_context("cos_mu", cos_mu.to_string()),
        ));
    }
    let sin_mu = block[(0, 1)].signum() * (1.0 - cos_mu * cos_mu).sqrt();
    let beta = block[(0, 1)] / sin_mu;
    let alpha = (block[(0, 0)] - block[(1, 1)]) / (2.0 * sin_mu);
    Ok((beta, alpha))
}

fn periodic_dispersion(block: &Matrix2<f64>, column: &Vector2<f64>) -> Result<Vector2<f64>, VaError> {
    if column.iter().all(|v| *v == 0.0) {
        return Ok(Vector2::zeros());
    }
    let system = Matrix2::identity() - block;
    system
        .try_inverse()
        .map(|inverse| inverse * column)
        .ok_or_else(|| numerical(SINGULAR_MATRIX, "periodic dispersion system is singular"))
}

fn periodic_twiss(one_turn: &Matrix6<f64>, co: PhaseSpace) -> Result<Twiss, VaError> {
    let (betax, alphax) = periodic_plane(&plane_block(one_turn, 0), "x")?;
    let (betay, alphay) = periodic_plane(&plane_block(one_turn, 2), "y")?;
    let eta_x = periodic_dispersion(&plane_block(one_turn, 0), &dispersion_column(one_turn, 0))?;
    let eta_y = periodic_dispersion(&plane_block(one_turn, 2), &dispersion_column(one_turn, 2))?;
    Ok(Twiss {
        spos: 0.0,
        betax,
        alphax,
        mux: 0.0,
        betay,
        alphay,
        muy: 0.0,
        etax: eta_x[0],
        etapx: eta_x[1],
        etay: eta_y[0],
        etapy: eta_y[1],
        co,
    })
}

fn advance_plane(beta: f64, alpha: f64, block: &Matrix2<f64>) -> (f64, f64, f64) {
    let gamma = (1.0 + alpha * alpha) / beta;
    let (m11, m12, m21, m22) = (block[(0, 0)], block[(0, 1)], block[(1, 0)], block[(1, 1)]);
    let next_beta = m11 * m11 * beta - 2.0 * m11 * m12 * alpha + m12 * m12 * gamma;
    let next_alpha = -m11 * m21 * beta + (m11 * m22 + m12 * m21) * alpha - m12 * m22 * gamma;
    let dmu = m12.atan2(m11 * beta - m12 * alpha);
    (next_beta, next_alpha, dmu)
}

fn advance_twiss(twiss: &Twiss, map: &ElementMap, length: f64) -> Twiss {
    let mx = plane_block(&map.matrix, 0);
    let my = plane_block(&map.matrix, 2);
    let (betax, alphax, dmux) = advance_plane(twiss.betax, twiss.alphax, &mx);
    let (betay, alphay, dmuy) = advance_plane(twiss.betay, twiss.alphay, &my);
    let eta_x = mx * Vector2::new(twiss.etax, twiss.etapx) + dispersion_column(&map.matrix, 0);
    let eta_y = my * Vector2::new(twiss.etay, twiss.etapy) + dispersion_column(&map.matrix, 2);
    let co = map.apply(&to_vector(&twiss.co));
    Twiss {
        spos: twiss.spos + length,
        betax,
        alphax,
        mux: twiss.mux + dmux,
        betay,
        alphay,
        muy: twiss.muy + dmuy,
        etax: eta_x[0],
        etapx: eta_x[1],
        etay: eta_y[0],
        etapy: eta_y[1],
        co: to_point(&co),
    }
}

fn fractional_tune(mu: f64) -> f64 {
    let tune = mu / std::f64::consts::TAU;
    tune - tune.floor()
}

impl OpticsEngine for LinearEngine {
    fn find_closed_orbit(&self, lattice: &Lattice) -> Result<Vec<PhaseSpace>, VaError> {
        if lattice.is_empty() {
            return Err(numerical(NO_CLOSED_ORBIT, "lattice has no elements"));
        }
        let maps = element_maps(lattice);
        let total = compose(&maps);
        let m4: Matrix4<f64> = total.matrix.fixed_view::<4, 4>(0, 0).into_owned();
        let b4 = Vector4::new(total.offset[0], total.offset[1], total.offset[2], total.offset[3]);
        let system = Matrix4::identity() - m4;
        if system.determinant().abs() < SINGULARITY_THRESHOLD {
            return Err(numerical(SINGULAR_MATRIX, "closed-orbit system is singular"));
        }
        let fixed_point = system
            .lu()
            .solve(&b4)
            .ok_or_else(|| numerical(SINGULAR_MATRIX, "closed-orbit system is singular"))?;

        let mut z = Vector6::new(fixed_point[0], fixed_point[1], fixed_point[2], fixed_point[3], 0.0, 0.0);
        let mut orbit = Vec::with_capacity(lattice.len() + 1);
        orbit.push(to_point(&z));
        for (idx, (map, element)) in maps.iter().zip(&lattice.elements).enumerate() {
            if !is_finite(&z) || !element.contains(z[0], z[2]) {
                return Err(VaError::Numerical(
                    ErrorInfo::new(NO_CLOSED_ORBIT, "closed orbit leaves the vacuum chamber")
                        .with_context("element", idx.to_string())
                        .with_context("family", element.family.clone()),
                ));
            }
            z = map.apply(&z);
            orbit.push(to_point(&z));
        }
        debug!(x0 = orbit[0][0], y0 = orbit[0][2], "closed orbit found");
        Ok(orbit)
    }

    fn compute_twiss_and_transfer_matrix(
        &self,
        lattice: &Lattice,
        boundary: TwissBoundary<'_>,
    ) -> Result<LinearOptics, VaError> {
        let maps = element_maps(lattice);
        let total = compose(&maps);
        let (start, periodic) = match boundary {
            TwissBoundary::Periodic(orbit) => {
                let co = orbit.first().copied().unwrap_or([0.0; 6]);
                (periodic_twiss(&total.matrix, co)?, true)
            }
            TwissBoundary::Seed(seed) => (seed, false),
        };

        let mut points = Vec::with_capacity(lattice.len() + 1);
        let mut current = start;
        points.push(current);
        for (map, element) in maps.iter().zip(&lattice.elements) {
            current = advance_twiss(&current, map, element.length);
            points.push(current);
        }
        let tunes = periodic.then(|| [fractional_tune(current.mux), fractional_tune(current.muy)]);
        Ok(LinearOptics {
            twiss: TwissTable::new(points),
            transfer_matrix: total.matrix,
            tunes,
        })
    }

    fn compute_equilibrium_parameters(
        &self,
        lattice: &Lattice,
        twiss: &TwissTable,
    ) -> Result<EquilibriumSummary, VaError> {
        if !lattice.has_dipoles() {
            return Err(numerical(EQUILIBRIUM_UNDEFINED, "lattice has no dipoles"));
        }
        if twiss.len() < lattice.len() + 1 {
            return Err(VaError::Numerical(
                ErrorInfo::new(EQUILIBRIUM_UNDEFINED, "twiss table does not cover the lattice")
                    .with_context("twiss", twiss.len().to_string())
                    .with_context("elements", lattice.len().to_string()),
            ));
        }

        let (mut i1, mut i2, mut i3, mut i4, mut i5) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (idx, element) in lattice.elements.iter().enumerate() {
            let angle = element.bending_angle();
            if angle == 0.0 || element.length == 0.0 {
                continue;
            }
            let h = angle / element.length;
            let entrance = &twiss.points[idx];
            let exit = &twiss.points[idx + 1];
            let eta = 0.5 * (entrance.etax + exit.etax);
            let curly_h = 0.5 * (entrance.curly_h() + exit.curly_h());
            i1 += eta * h * element.length;
            i2 += h * h * element.length;
            i3 += h.abs().powi(3) * element.length;
            i4 += eta * h.powi(3) * element.length;
            i5 += curly_h * h.abs().powi(3) * element.length;
        }
        if i2 <= 0.0 {
            return Err(numerical(EQUILIBRIUM_UNDEFINED, "second radiation integral vanishes"));
        }

        let jx = 1.0 - i4 / i2;
        let je = 2.0 + i4 / i2;
        if jx <= 0.0 || je <= 0.0 {
            return Err(VaError::Numerical(
                ErrorInfo::new(EQUILIBRIUM_UNDEFINED, "radiation anti-damping")
                    .with_context("jx", jx.to_string())
                    .with_context("je", je.to_string()),
            ));
        }

        let energy = lattice.energy;
        let gamma = energy / ELECTRON_REST_ENERGY_EV;
        let circumference = lattice.length();
        let period = circumference / LIGHT_SPEED;
        let emittance = CQ * gamma * gamma * i5 / (jx * i2);
        let energy_spread = (CQ * gamma * gamma * i3 / (je * i2)).sqrt();
        let energy_gev = energy / 1e9;
        let energy_loss_per_turn = CGAMMA / std::f64::consts::TAU * energy_gev.powi(4) * i2 * 1e9;
        let damping = |partition: f64| 2.0 * energy * period / (partition * energy_loss_per_turn);
        let damping_times = [damping(jx), damping(1.0), damping(je)];
        let momentum_compaction = i1 / circumference;

        let voltage = lattice.rf_voltage();
        if voltage <= energy_loss_per_turn {
            return Err(VaError::Numerical(
                ErrorInfo::new(EQUILIBRIUM_UNDEFINED, "rf voltage below energy loss per turn")
                    .with_context("voltage", voltage.to_string())
                    .with_context("u0", energy_loss_per_turn.to_string())
                    .with_hint("raise the cavity voltage"),
            ));
        }
        let harmonic = lattice.harmonic_number as f64;
        if momentum_compaction <= 0.0 || harmonic == 0.0 {
            return Err(VaError::Numerical(
                ErrorInfo::new(EQUILIBRIUM_UNDEFINED, "no stable synchrotron motion")
                    .with_context("alpha", momentum_compaction.to_string())
                    .with_context("harmonic_number", lattice.harmonic_number.to_string()),
            ));
        }
        let synchrotron_tune = (harmonic
            * momentum_compaction
            * (voltage * voltage - energy_loss_per_turn * energy_loss_per_turn).sqrt()
            / (std::f64::consts::TAU * energy))
            .sqrt();
        let q = voltage / energy_loss_per_turn;
        let bucket = 2.0 * ((q * q - 1.0).sqrt() - (1.0 / q).acos());
        let energy_acceptance = (energy_loss_per_turn
            / (std::f64::consts::PI * momentum_compaction * harmonic * energy)
            * bucket)
            .sqrt();

        debug!(emittance, energy_spread, energy_loss_per_turn, "equilibrium computed");
        Ok(EquilibriumSummary {
            energy,
            revolution_period: period,
            emittance,
            energy_spread,
            momentum_compaction,
            energy_loss_per_turn,
            damping_times,
            synchrotron_tune,
            energy_acceptance,
        })
    }

    fn compute_lifetimes_from_lattice(
        &self,
        lattice: &Lattice,
        twiss: &TwissTable,
        equilibrium: &EquilibriumSummary,
        inputs: &LifetimeInputs,
    ) -> Result<LatticeLifetimes, VaError> {
        let acceptances = transverse_acceptances(lattice, twiss);
        if !(acceptances.0.is_finite() && acceptances.1.is_finite()) {
            return Err(numerical(UNSTABLE_OPTICS, "transverse acceptance is undefined"));
        }
        let elastic = elastic_lifetime(
            equilibrium.energy,
            inputs,
            twiss.average_betas(),
            acceptances,
        );
        let inelastic = inelastic_lifetime(inputs, equilibrium.energy_acceptance);
        let coupling = inputs.coupling;
        let emit_x = equilibrium.emittance / (1.0 + coupling);
        let emit_y = equilibrium.emittance * coupling / (1.0 + coupling);
        let rate = quantum_lifetime(acceptances.0, emit_x, equilibrium.damping_times[0]).recip()
            + quantum_lifetime(acceptances.1, emit_y, equilibrium.damping_times[1]).recip();
        let quantum = if rate > 0.0 { rate.recip() } else { f64::INFINITY };
        Ok(LatticeLifetimes {
            elastic,
            inelastic,
            quantum,
        })
    }

    fn track_particles_through_line(
        &self,
        lattice: &Lattice,
        particles: &[PhaseSpace],
    ) -> Result<Vec<Vec<PhaseSpace>>, VaError> {
        let maps = element_maps(lattice);
        let lost = [f64::NAN; 6];
        let mut tracks = Vec::with_capacity(particles.len());
        for (particle_idx, particle) in particles.iter().enumerate() {
            let mut z = to_vector(particle);
            if !is_finite(&z) {
                return Err(VaError::Numerical(
                    ErrorInfo::new(TRACKING_DIVERGED, "initial coordinates are not finite")
                        .with_context("particle", particle_idx.to_string()),
                ));
            }
            let mut track = Vec::with_capacity(lattice.len() + 1);
            track.push(*particle);
            let mut alive = true;
            for (map, element) in maps.iter().zip(&lattice.elements) {
                if alive {
                    alive = element.contains(z[0], z[2]);
                }
                if alive {
                    z = map.apply(&z);
                    alive = is_finite(&z) && element.contains(z[0], z[2]);
                }
                track.push(if alive { to_point(&z) } else { lost });
            }
            tracks.push(track);
        }
        Ok(tracks)
    }
}
