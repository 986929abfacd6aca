use std::sync::Arc;

use va_core::{Clock, ManualClock, PvValue, UNDEF_VALUE};
use va_optics::LinearEngine;
use va_stage::{MachineConfig, StageController, StageState};

fn linear_stage(prefix: &str) -> StageController {
    let config = MachineConfig::default()
        .stage(prefix)
        .cloned()
        .expect("stage in default machine");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(0.0));
    StageController::new(config, Box::new(LinearEngine), clock).expect("stage")
}

fn scalar(value: Option<PvValue>) -> f64 {
    value.and_then(|value| value.as_scalar()).expect("scalar pv")
}

#[test]
fn storage_ring_settles_with_physical_tunes() {
    let mut si = linear_stage("SI");
    assert_eq!(si.update_state(false), StageState::Clean);
    let equilibrium = si.cache().equilibrium.expect("equilibrium");
    assert!(equilibrium.emittance > 0.0 && equilibrium.emittance < 1e-6);

    assert!(si.set("SI-Glob:VA-Beam:BeamCurrentAdd-SP", PvValue::Scalar(10.0)));
    for name in ["SI-Glob:DI-Tune:Freq1-Mon", "SI-Glob:DI-Tune:Freq2-Mon"] {
        let tune = scalar(si.get(name));
        assert!(tune > 0.0 && tune < 1.0, "{name} = {tune}");
    }
    let x = scalar(si.get("SI-01:DI-BPM:PosX-Mon"));
    assert!(x.abs() < 1e-6);
    assert_ne!(scalar(si.get("SI-Glob:AP-CurrInfo:CurrLT-Mon")), UNDEF_VALUE);
}

#[test]
fn corrector_moves_the_storage_ring_orbit() {
    let mut si = linear_stage("SI");
    si.update_state(false);
    si.set("SI-Glob:VA-Beam:BeamCurrentAdd-SP", PvValue::Scalar(10.0));
    assert!(si.set("SI-Fam:PS-CH:Current-SP", PvValue::Scalar(0.2)));
    assert_eq!(si.update_state(false), StageState::Clean);
    let moved = (1..=10)
        .map(|n| scalar(si.get(&format!("SI-{n:02}:DI-BPM:PosX-Mon"))))
        .any(|x| x.abs() > 1.0);
    assert!(moved);
}

#[test]
fn linac_transmits_its_own_beam() {
    let mut li = linear_stage("LI");
    li.update_state(false);
    let efficiency = li.transport_efficiency().expect("efficiency");
    assert!(efficiency > 0.0 && efficiency <= 1.0);
    assert!(li.latest_parameters().is_some());
}

#[test]
fn booster_reports_both_efficiencies() {
    let mut li = linear_stage("LI");
    li.update_state(false);
    let beam = li.latest_parameters().cloned().expect("linac beam");

    let mut bo = linear_stage("BO");
    bo.receive_parameters(beam);
    assert_eq!(bo.update_state(false), StageState::Clean);
    for efficiency in [bo.injection_efficiency(), bo.ejection_efficiency()] {
        let efficiency = efficiency.expect("efficiency");
        assert!((0.0..=1.0).contains(&efficiency));
    }
}
