use proptest::prelude::*;
use va_optics::{Element, ElementKind, Lattice};
use va_stage::{
    reslot, KickerGuard, MagnetField, PowerSupply, PowerSupplyConfig, PulsedMagnet,
    PulsedMagnetConfig, PulsedRole,
};

fn kicker_lattice() -> Lattice {
    Lattice::new(
        3.0e9,
        4,
        vec![
            Element::marker("start"),
            Element::kicker("InjKckr", 0.5),
            Element::drift("D", 1.0),
            Element::quadrupole("QF", 0.2, 1.0),
            Element::quadrupole("QF", 0.2, 1.0),
        ],
    )
}

fn kick_of(lattice: &Lattice, idx: usize) -> f64 {
    match lattice.elements[idx].kind {
        ElementKind::Kicker { angle } => angle,
        ref other => panic!("not a kicker: {other:?}"),
    }
}

#[test]
fn reslot_accumulates_and_wraps() {
    let sep = 2.0e-9;
    let charge = [1.0, 2.0, 3.0, 4.0];
    let times = [0.0, sep, 4.0 * sep, 5.0 * sep];
    let (slots, slot_times) = reslot(&charge, &times, 0.0, sep, 4);
    // bucket 4 wraps to 0, bucket 5 to 1
    assert_eq!(slots, vec![5.0, 6.0, 0.0, 0.0]);
    assert_eq!(slot_times[1], 5.0 * sep);
}

#[test]
fn reslot_rounds_to_the_nearest_bucket() {
    let sep = 2.0e-9;
    let (slots, _) = reslot(&[1.0, 1.0], &[0.4 * sep + 1.0e-9, 2.6 * sep + 1.0e-9], 1.0e-9, sep, 8);
    assert_eq!(slots[0], 1.0);
    assert_eq!(slots[3], 1.0);
}

proptest! {
    #[test]
    fn reslot_conserves_charge(
        bunches in prop::collection::vec((0.0f64..1e-9, 0usize..2000), 1..64),
        harmonic in 1usize..900,
    ) {
        let sep = 2.0e-9;
        let charge: Vec<f64> = bunches.iter().map(|(q, _)| *q).collect();
        let times: Vec<f64> = bunches.iter().map(|(_, n)| *n as f64 * sep).collect();
        let (slots, _) = reslot(&charge, &times, 0.0, sep, harmonic);
        prop_assert_eq!(slots.len(), harmonic);
        let before: f64 = charge.iter().sum();
        let after: f64 = slots.iter().sum();
        prop_assert!((before - after).abs() <= 1e-12 * before.max(1e-30));
    }
}

#[test]
fn flat_top_window_selects_bunches() {
    let mut config = PulsedMagnetConfig::new("InjKckr", PulsedRole::InjectionKicker);
    config.delay = 10.0e-9;
    config.rise_time = 5.0e-9;
    config.flat_top = 20.0e-9;
    config.flight_time = 3.0e-9;
    let magnet = PulsedMagnet::new(&config, vec![1]);
    let (start, end) = magnet.window();
    assert!((start - 15.0e-9).abs() < 1e-18 && (end - 35.0e-9).abs() < 1e-18);

    // arrivals: t + flight - master = 2, 12, 22, 32, 42 ns
    let charge = [1.0; 5];
    let times = [9.0e-9, 19.0e-9, 29.0e-9, 39.0e-9, 49.0e-9];
    let passed = magnet.timing_pass(&charge, &times, 10.0e-9);
    assert_eq!(passed, vec![0.0, 0.0, 1.0, 1.0, 0.0]);
    assert!((magnet.slot_origin() - 12.0e-9).abs() < 1e-18);
}

#[test]
fn disabled_magnet_blocks_every_bunch() {
    let mut config = PulsedMagnetConfig::new("InjKckr", PulsedRole::InjectionKicker);
    config.enabled = false;
    let magnet = PulsedMagnet::new(&config, vec![1]);
    assert_eq!(magnet.timing_pass(&[1.0, 2.0], &[0.0, 1.0e-9], 0.0), vec![0.0, 0.0]);
}

#[test]
fn kicker_guard_restores_zero_kick() {
    let mut lattice = kicker_lattice();
    let mut config = PulsedMagnetConfig::new("InjKckr", PulsedRole::InjectionKicker);
    config.kick = 3.0e-3;
    let magnet = PulsedMagnet::new(&config, vec![1]);
    {
        let guard = KickerGuard::engage(&mut lattice, [&magnet]);
        assert_eq!(guard.engaged(), 1);
        assert_eq!(kick_of(&guard, 1), 3.0e-3);
    }
    assert_eq!(kick_of(&lattice, 1), 0.0);

    let mut off = magnet.clone();
    off.enabled = false;
    let guard = KickerGuard::engage(&mut lattice, [&off]);
    assert_eq!(guard.engaged(), 0);
}

#[test]
fn power_supply_reads_back_and_clamps() {
    let mut lattice = kicker_lattice();
    let config = PowerSupplyConfig::new("QF", MagnetField::Gradient, 0.01, 0.0, 150.0);
    let mut supply = PowerSupply::new(&config, vec![3, 4], &mut lattice);
    assert!((supply.current() - 100.0).abs() < 1e-9);

    let change = supply.set_current(200.0, &mut lattice);
    assert!(change.clamped && change.changed);
    assert_eq!(change.applied, 150.0);
    for idx in [3, 4] {
        match lattice.elements[idx].kind {
            ElementKind::Quadrupole { k } => assert!((k - 1.5).abs() < 1e-12),
            ref other => panic!("not a quadrupole: {other:?}"),
        }
    }

    let again = supply.set_current(150.0, &mut lattice);
    assert!(!again.clamped && !again.changed);
}

#[test]
fn configured_current_overrides_the_lattice() {
    let mut lattice = kicker_lattice();
    let mut config = PowerSupplyConfig::new("QF", MagnetField::Gradient, 0.01, 0.0, 150.0);
    config.current = Some(50.0);
    let supply = PowerSupply::new(&config, vec![3, 4], &mut lattice);
    assert_eq!(supply.current(), 50.0);
    assert!(matches!(lattice.elements[4].kind, ElementKind::Quadrupole { k } if (k - 0.5).abs() < 1e-12));
}
