mod fixtures;

use va_optics::{
    ElementKind, LifetimeInputs, LinearEngine, OpticsEngine, TwissBoundary,
};

#[test]
fn aligned_ring_has_zero_closed_orbit() {
    let ring = fixtures::fodo_ring(20, 0.012);
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    assert_eq!(orbit.len(), ring.len() + 1);
    assert!(orbit.iter().all(|p| p[0].abs() < 1e-15 && p[2].abs() < 1e-15));
}

#[test]
fn corrector_kick_moves_the_orbit() {
    let mut ring = fixtures::fodo_ring(20, 0.012);
    let idx = ring.first_index("CH").expect("corrector");
    ring.elements[idx].kind = ElementKind::Corrector {
        hkick: 1e-5,
        vkick: -1e-5,
    };
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    let max_x = orbit.iter().map(|p| p[0].abs()).fold(0.0, f64::max);
    let max_y = orbit.iter().map(|p| p[2].abs()).fold(0.0, f64::max);
    assert!(max_x > 1e-6, "max_x {max_x}");
    assert!(max_y > 1e-6, "max_y {max_y}");
    let first = orbit.first().expect("first");
    let last = orbit.last().expect("last");
    for plane in 0..4 {
        assert!((first[plane] - last[plane]).abs() < 1e-12);
    }
}

#[test]
fn misaligned_quadrupole_steers_the_beam() {
    let mut ring = fixtures::fodo_ring(20, 0.012);
    let idx = ring.first_index("QF").expect("quadrupole");
    ring.elements[idx].dx = 50e-6;
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    assert!(orbit.iter().any(|p| p[0].abs() > 1e-6));
}

#[test]
fn orbit_outside_chamber_is_reported() {
    let mut ring = fixtures::fodo_ring(20, 0.012);
    let idx = ring.first_index("CH").expect("corrector");
    ring.elements[idx].kind = ElementKind::Corrector {
        hkick: 0.05,
        vkick: 0.0,
    };
    let err = LinearEngine.find_closed_orbit(&ring).expect_err("orbit too large");
    assert!(err.is_numerical());
    assert_eq!(err.info().code, "no-closed-orbit");
}

#[test]
fn periodic_twiss_closes_on_itself() {
    let ring = fixtures::fodo_ring(20, 0.012);
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    let optics = LinearEngine
        .compute_twiss_and_transfer_matrix(&ring, TwissBoundary::Periodic(&orbit))
        .expect("twiss");
    let first = optics.twiss.points.first().expect("first");
    let last = optics.twiss.last().expect("last");
    assert!((first.betax - last.betax).abs() < 1e-9 * first.betax);
    assert!((first.betay - last.betay).abs() < 1e-9 * first.betay);
    assert!((first.etax - last.etax).abs() < 1e-9);
    assert!(first.etax > 0.0);
    let tunes = optics.tunes.expect("tunes");
    assert!(tunes.iter().all(|t| *t > 0.0 && *t < 1.0));
}

#[test]
fn drift_ring_has_no_closed_orbit_or_optics() {
    let ring = fixtures::drift_ring();
    let err = LinearEngine.find_closed_orbit(&ring).expect_err("singular");
    assert_eq!(err.info().code, "singular-matrix");

    let zero = vec![[0.0; 6]; ring.len() + 1];
    let err = LinearEngine
        .compute_twiss_and_transfer_matrix(&ring, TwissBoundary::Periodic(&zero))
        .expect_err("unstable");
    assert_eq!(err.info().code, "unstable-optics");
}

#[test]
fn equilibrium_of_the_fodo_ring() {
    let ring = fixtures::fodo_ring(20, 0.012);
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    let optics = LinearEngine
        .compute_twiss_and_transfer_matrix(&ring, TwissBoundary::Periodic(&orbit))
        .expect("twiss");
    let eq = LinearEngine
        .compute_equilibrium_parameters(&ring, &optics.twiss)
        .expect("equilibrium");
    assert!(eq.emittance > 0.0 && eq.emittance < 1e-5);
    assert!(eq.energy_spread > 1e-4 && eq.energy_spread < 1e-2);
    assert!(eq.energy_loss_per_turn > 0.0 && eq.energy_loss_per_turn < 3.0e6);
    assert!(eq.damping_times.iter().all(|tau| *tau > 0.0));
    assert!(eq.synchrotron_tune > 0.0);
    assert!(eq.energy_acceptance > 0.0);
    assert!(eq.momentum_compaction > 0.0);

    let lifetimes = LinearEngine
        .compute_lifetimes_from_lattice(&ring, &optics.twiss, &eq, &LifetimeInputs::default())
        .expect("lifetimes");
    assert!(lifetimes.elastic > 0.0 && lifetimes.elastic.is_finite());
    assert!(lifetimes.inelastic > 0.0 && lifetimes.inelastic.is_finite());
    assert!(lifetimes.quantum > 0.0);
}

#[test]
fn equilibrium_needs_dipoles_and_voltage() {
    let ring = fixtures::quadrupole_ring(10);
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    let optics = LinearEngine
        .compute_twiss_and_transfer_matrix(&ring, TwissBoundary::Periodic(&orbit))
        .expect("twiss");
    let err = LinearEngine
        .compute_equilibrium_parameters(&ring, &optics.twiss)
        .expect_err("no dipoles");
    assert_eq!(err.info().code, "equilibrium-undefined");

    let mut ring = fixtures::fodo_ring(20, 0.012);
    ring.elements[0].kind = ElementKind::Cavity {
        voltage: 1.0,
        frequency: 499.654e6,
    };
    let orbit = LinearEngine.find_closed_orbit(&ring).expect("closed orbit");
    let optics = LinearEngine
        .compute_twiss_and_transfer_matrix(&ring, TwissBoundary::Periodic(&orbit))
        .expect("twiss");
    let err = LinearEngine
        .compute_equilibrium_parameters(&ring, &optics.twiss)
        .expect_err("voltage below u0");
    assert_eq!(err.info().code, "equilibrium-undefined");
    assert!(err.info().hint.is_some());
}

#[test]
fn tracking_marks_lost_particles_with_nan() {
    let line = fixtures::line(0.01, 0.01);
    let tracks = LinearEngine
        .track_particles_through_line(&line, &[[0.001, 0.0, 0.0, 0.0, 0.0, 0.0], [0.02, 0.0, 0.0, 0.0, 0.0, 0.0]])
        .expect("tracking");
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].len(), line.len() + 1);
    assert!(tracks[0].iter().all(|p| p[0].is_finite()));
    assert!(tracks[1].last().expect("end")[0].is_nan());

    let err = LinearEngine
        .track_particles_through_line(&line, &[[f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0]])
        .expect_err("non-finite start");
    assert_eq!(err.info().code, "tracking-diverged");
}
