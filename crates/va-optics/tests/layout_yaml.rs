use va_optics::{ElementKind, LatticeLayout};

const LAYOUT: &str = r#"
energy: 3.0e9
harmonic_number: 864
head:
  - family: SRFCav
    kind: { type: cavity, voltage: 3.0e6, frequency: 499.654e6 }
cell:
  - family: QF
    kind: { type: quadrupole, k: 2.0 }
    length: 0.2
  - family: D
    kind: { type: drift }
    length: 1.0
    hmax: 0.02
  - family: QD
    kind: { type: quadrupole, k: -2.0 }
    length: 0.2
    roll: 0.001
cells: 3
tail:
  - family: InjSeptum
    kind: { type: kicker }
    length: 0.5
"#;

#[test]
fn layout_expands_cells_between_head_and_tail() {
    let layout: LatticeLayout = serde_yaml::from_str(LAYOUT).expect("layout");
    let lattice = layout.build().expect("lattice");
    assert_eq!(lattice.len(), 1 + 3 * 3 + 1);
    assert_eq!(lattice.family_indices("QF"), vec![1, 4, 7]);
    assert_eq!(lattice.harmonic_number, 864);
    assert!((lattice.length() - (3.0 * 1.4 + 0.5)).abs() < 1e-12);
    assert_eq!(lattice.rf_voltage(), 3.0e6);

    let drift = &lattice.elements[2];
    assert_eq!(drift.hmax, 0.02);
    assert_eq!(drift.hmin, -0.012);
    assert!(matches!(
        lattice.elements.last().expect("tail").kind,
        ElementKind::Kicker { angle } if angle == 0.0
    ));
}

#[test]
fn layout_rejects_non_positive_energy() {
    let layout: LatticeLayout = serde_yaml::from_str("energy: 0.0\n").expect("layout");
    let err = layout.build().expect_err("energy");
    assert_eq!(err.info().code, "lattice-energy");
}

#[test]
fn layout_rejects_bends_without_length() {
    let thin_bend = r#"
energy: 3.0e9
cell:
  - family: B1
    kind: { type: dipole, angle: 0.05 }
    length: 0.0
"#;
    let layout: LatticeLayout = serde_yaml::from_str(thin_bend).expect("layout");
    let err = layout.build().expect_err("zero-length bend");
    assert_eq!(err.info().code, "element-length");
    assert_eq!(err.info().context.get("family").map(String::as_str), Some("B1"));

    let negative = thin_bend.replace("length: 0.0", "length: -1.0");
    let layout: LatticeLayout = serde_yaml::from_str(&negative).expect("layout");
    assert_eq!(layout.build().expect_err("negative").info().code, "element-length");

    let straight = thin_bend.replace("angle: 0.05", "angle: 0.0");
    let layout: LatticeLayout = serde_yaml::from_str(&straight).expect("layout");
    layout.build().expect("a straight zero-length dipole is a marker");
}

#[test]
fn lattice_round_trips_through_json() {
    let layout: LatticeLayout = serde_yaml::from_str(LAYOUT).expect("layout");
    let lattice = layout.build().expect("lattice");
    let json = serde_json::to_string(&lattice).expect("json");
    let back: va_optics::Lattice = serde_json::from_str(&json).expect("decode");
    assert_eq!(back, lattice);
}
