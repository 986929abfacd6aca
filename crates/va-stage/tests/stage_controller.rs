
use std::collections::BTreeMap;

use va_core::{PvValue, UNDEF_VALUE};
use va_stage::{PhysicsParameters, Refresh, StageOutput, StageState};

#[test]
fn power_supply_setpoint_is_clamped_and_mirrored() {
    let (mut si, _clock) = fixtures::stage("SI");
    si.update_state(false);
    si.take_outputs();

    assert!(si.set("SI-Fam:PS-QF:Current-SP", PvValue::Scalar(500.0)));
    assert_eq!(fixtures::scalar(si.get("SI-Fam:PS-QF:Current-RB")), 300.0);
    let outputs = si.take_outputs();
    assert_eq!(
        fixtures::pushed(&outputs, "SI-Fam:PS-QF:Current-SP"),
        Some(PvValue::Scalar(300.0))
    );
    assert_eq!(
        fixtures::pushed(&outputs, "SI-Fam:PS-QF:Current-RB"),
        Some(PvValue::Scalar(300.0))
    );
    assert_eq!(si.state(), StageState::Dirty);
}

#[test]
fn unchanged_setpoint_keeps_the_cache_clean() {
    let (mut si, _clock) = fixtures::stage("SI");
    assert_eq!(si.update_state(false), StageState::Clean);
    let current = fixtures::scalar(si.get("SI-Fam:PS-QD:Current-SP"));
    assert!(si.set("SI-Fam:PS-QD:Current-SP", PvValue::Scalar(current)));
    assert_eq!(si.state(), StageState::Clean);

    assert!(si.set("SI-Fam:PS-QD:Current-SP", PvValue::Scalar(current + 1.0)));
    assert_eq!(si.state(), StageState::Dirty);
    assert_eq!(si.update_state(false), StageState::Clean);
}

#[test]
fn optics_failure_dumps_the_beam() {
    let (mut si, _clock) = fixtures::stage_with("SI", Box::new(fixtures::FailingEngine));
    assert!(si.set("SI-Glob:VA-Beam:BeamCurrentAdd-SP", PvValue::Scalar(10.0)));
    assert!(si.total_charge() > 0.0);

    assert_eq!(si.update_state(false), StageState::BeamLost);
    assert!(si.charges().iter().all(|q| *q == 0.0));
    assert!(si.cache().orbit.is_none());
    assert!(si.cache().optics.is_none());
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-DCCT:HwFlt-Mon")), 1.0);
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-Tune:Freq1-Mon")), UNDEF_VALUE);

    assert!(si.set("SI-Fam:FK-QF:ErrX-SP", PvValue::Scalar(1.0e-6)));
    assert_eq!(si.state(), StageState::Dirty);
}

#[test]
fn tunes_are_undefined_without_beam() {
    let (mut si, _clock) = fixtures::stage("SI");
    si.update_state(false);
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-Tune:Freq1-Mon")), UNDEF_VALUE);

    assert!(si.set("SI-Glob:VA-Beam:BeamCurrentAdd-SP", PvValue::Scalar(100.0)));
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-Tune:Freq1-Mon")), fixtures::TUNES[0]);
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-Tune:Freq2-Mon")), fixtures::TUNES[1]);
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-Tune:Freq3-Mon")), 0.004);
    let current = fixtures::scalar(si.get("SI-Glob:DI-DCCT:Current-Mon"));
    assert!((current - 100.0).abs() < 1e-9);
}

#[test]
fn storage_ring_bpms_need_beam() {
    let (mut si, _clock) = fixtures::stage("SI");
    si.update_state(false);
    assert_eq!(fixtures::scalar(si.get("SI-01:DI-BPM:PosX-Mon")), UNDEF_VALUE);
    si.set("SI-Glob:VA-Beam:BeamCurrentAdd-SP", PvValue::Scalar(1.0));
    let x = fixtures::scalar(si.get("SI-01:DI-BPM:PosX-Mon"));
    let y = fixtures::scalar(si.get("SI-01:DI-BPM:PosY-Mon"));
    assert!((x - 1000.0).abs() < 1e-6);
    assert!((y + 2000.0).abs() < 1e-6);

    let (mut bo, _clock) = fixtures::stage("BO");
    bo.update_state(false);
    assert!((fixtures::scalar(bo.get("BO-01:DI-BPM:PosX-Mon")) - 1000.0).abs() < 1e-6);
}

#[test]
fn bpm_positions_are_measured_from_the_lattice_origin() {
    let (mut si, _clock) = fixtures::stage("SI");
    let positions = match si.get("SI-Glob:MO-Lattice:BPMPos-Cte") {
        Some(PvValue::Array(values)) => values,
        other => panic!("unexpected value {other:?}"),
    };
    assert_eq!(positions.len(), 118);
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(positions[0] > 0.0);
}

#[test]
fn negative_current_threshold_is_pushed_back() {
    let (mut si, _clock) = fixtures::stage("SI");
    assert!(si.set("SI-Glob:DI-DCCT:CurrThold", PvValue::Scalar(0.5)));
    si.take_outputs();
    assert!(si.set("SI-Glob:DI-DCCT:CurrThold", PvValue::Scalar(-1.0)));
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-DCCT:CurrThold")), 0.5);
    assert_eq!(
        fixtures::pushed(&si.take_outputs(), "SI-Glob:DI-DCCT:CurrThold"),
        Some(PvValue::Scalar(0.5))
    );

    si.set("SI-Glob:VA-Beam:BeamCurrentAdd-SP", PvValue::Scalar(0.1));
    assert_eq!(fixtures::scalar(si.get("SI-Glob:DI-DCCT:Current-Mon")), 0.0);
}

#[test]
fn unknown_and_malformed_names_are_not_handled() {
    let (mut si, _clock) = fixtures::stage("SI");
    assert!(si.get("SI-Fam:PS-QX:Current-SP").is_none());
    assert!(!si.set("SI-Fam:PS-QX:Current-SP", PvValue::Scalar(1.0)));
    assert!(si.get("not a pv").is_none());
    assert!(!si.set("SI-Fam:PS-QF:Current-SP", PvValue::Scalar(f64::NAN)));
}

#[test]
fn transport_line_waits_for_upstream_beam() {
    let (mut tb, _clock) = fixtures::stage("TB");
    assert_eq!(tb.update_state(false), StageState::Clean);
    assert!(tb.transport_efficiency().is_none());
    assert!(tb.latest_parameters().is_none());

    tb.receive_parameters(fixtures::upstream_beam());
    tb.update_state(false);
    let efficiency = tb.transport_efficiency().expect("efficiency");
    assert!(efficiency > 0.99 && efficiency <= 1.0);
    let latest = tb.latest_parameters().expect("published beam");
    assert_eq!(latest.init_twiss.co, fixtures::ORBIT);
    assert!(tb.take_outputs().iter().any(|output| matches!(
        output,
        StageOutput::ForwardParameters(PhysicsParameters::Injection(_))
    )));
}

#[test]
fn line_failure_is_total_loss_not_a_beam_dump() {
    let (mut tb, _clock) = fixtures::stage_with("TB", Box::new(fixtures::FailingEngine));
    tb.receive_parameters(fixtures::upstream_beam());
    assert_eq!(tb.update_state(false), StageState::Clean);
    assert_eq!(tb.transport_efficiency(), Some(0.0));
    assert!(tb.latest_parameters().is_none());
}

fn withdrawn(outputs: &[StageOutput]) -> bool {
    outputs.iter().any(|output| {
        matches!(output, StageOutput::ForwardParameters(PhysicsParameters::Withdrawn))
    })
}

#[test]
fn withdrawn_upstream_beam_is_passed_down_the_line() {
    let (mut tb, _clock) = fixtures::stage("TB");
    tb.receive_parameters(fixtures::upstream_beam());
    tb.update_state(false);
    assert!(tb.latest_parameters().is_some());
    tb.take_outputs();

    tb.handle_parameters(PhysicsParameters::Withdrawn);
    tb.update_state(false);
    assert!(tb.transport_efficiency().is_none());
    assert!(tb.latest_parameters().is_none());
    assert!(withdrawn(&tb.take_outputs()));

    // nothing left to retract
    tb.handle_parameters(PhysicsParameters::Withdrawn);
    tb.update_state(false);
    assert!(!withdrawn(&tb.take_outputs()));
}

#[test]
fn booster_beam_dump_retracts_its_published_beam() {
    let (mut bo, _clock) = fixtures::stage("BO");
    bo.receive_parameters(fixtures::upstream_beam());
    bo.update_state(false);
    assert!(bo.latest_parameters().is_some());
    bo.take_outputs();

    bo.beam_dump("ramp fault");
    assert!(bo.latest_parameters().is_none());
    assert!(withdrawn(&bo.take_outputs()));
    assert_eq!(bo.state(), StageState::BeamLost);
}

#[test]
fn ring_without_upstream_beam_has_no_injection_efficiency() {
    let (mut si, _clock) = fixtures::stage("SI");
    si.receive_parameters(fixtures::upstream_beam());
    si.update_state(false);
    assert!(si.injection_efficiency().is_some());

    si.handle_parameters(PhysicsParameters::Withdrawn);
    si.update_state(false);
    assert!(si.injection_efficiency().is_none());
}

#[test]
fn booster_cycle_injects_and_extracts() {
    let (mut bo, _clock) = fixtures::stage("BO");
    bo.receive_parameters(fixtures::upstream_beam());
    bo.update_state(false);
    let injection = bo.injection_efficiency().expect("injection efficiency");
    let ejection = bo.ejection_efficiency().expect("ejection efficiency");
    assert!(injection > 0.99);
    assert!(ejection > 0.99);
    assert!(bo.latest_parameters().is_some());

    let outcome = bo
        .run_injection_cycle(fixtures::cycle(vec![0.25e-9; 4], 0))
        .expect("cycle");
    let forward = outcome.forward.expect("forwarded cycle");
    assert_eq!(forward.charge.len(), 828);
    assert_eq!(forward.ejection_efficiency, Some(ejection));
    assert!((forward.total_charge() - 1.0e-9 * injection).abs() < 1e-21);
    assert!(bo.charges().iter().all(|q| *q == 0.0));
}

#[test]
fn disabled_ramp_dumps_the_booster_beam() {
    let (mut bo, _clock) = fixtures::stage("BO");
    bo.receive_parameters(fixtures::upstream_beam());
    bo.update_state(false);
    assert!(bo.set("BO-Glob:TI-RampPS:Enbl-SP", PvValue::Scalar(0.0)));
    assert_eq!(
        fixtures::pushed(&bo.take_outputs(), "BO-Glob:TI-RampPS:Enbl-RB"),
        Some(PvValue::Scalar(0.0))
    );

    let outcome = bo
        .run_injection_cycle(fixtures::cycle(vec![1.0e-9], 0))
        .expect("cycle");
    assert!(outcome.forward.is_none());
    assert_eq!(outcome.delivered, 0.0);
    assert_eq!(bo.total_charge(), 0.0);
}

#[test]
fn storage_ring_needs_exactly_one_injection_kicker() {
    let (mut si, _clock) = fixtures::stage("SI");
    si.receive_parameters(fixtures::upstream_beam());
    si.update_state(false);
    assert!(si.injection_efficiency().expect("efficiency") > 0.99);

    assert!(si.set("SI-Fam:TI-InjNLKckr:Enbl-SP", PvValue::Scalar(1.0)));
    si.update_state(false);
    assert_eq!(si.injection_efficiency(), Some(0.0));

    assert!(si.set("SI-Fam:TI-InjDpKckr:Enbl-SP", PvValue::Scalar(0.0)));
    si.update_state(false);
    assert!(si.injection_efficiency().expect("efficiency") > 0.99);
}

#[test]
fn storage_ring_cycle_accumulates_charge() {
    let (mut si, clock) = fixtures::stage("SI");
    si.receive_parameters(fixtures::upstream_beam());
    si.update_state(false);
    let efficiency = si.injection_efficiency().expect("efficiency");

    si.run_injection_cycle(fixtures::cycle(vec![0.5e-9, 0.5e-9], 10))
        .expect("first cycle");
    si.run_injection_cycle(fixtures::cycle(vec![0.5e-9], 10))
        .expect("second cycle");
    let charges = si.charges();
    assert!((charges[10] - 1.0e-9 * efficiency).abs() < 1e-21);
    assert!((charges[11] - 0.5e-9 * efficiency).abs() < 1e-21);
    assert!(si.take_state_changed());

    clock.advance(3600.0);
    assert!(si.total_charge() < 1.5e-9 * efficiency);
}

#[test]
fn disabled_gun_stops_the_cycle() {
    let (mut li, _clock) = fixtures::stage("LI");
    li.update_state(false);
    let outcome = li
        .run_injection_cycle(va_stage::InjectionCycle::shot(0, fixtures::BUNCH_SEPARATION))
        .expect("cycle");
    let forward = outcome.forward.expect("gun shot");
    assert_eq!(forward.charge.len(), 75);
    assert!((outcome.received - 3.0e-9).abs() < 1e-21);

    assert!(li.set("LI-Glob:TI-EGun:Enbl-SP", PvValue::Scalar(0.0)));
    let outcome = li
        .run_injection_cycle(va_stage::InjectionCycle::shot(0, fixtures::BUNCH_SEPARATION))
        .expect("cycle");
    assert!(outcome.forward.is_none());
}

#[test]
fn gun_mode_rejects_out_of_range_selection() {
    let (mut li, _clock) = fixtures::stage("LI");
    assert!(li.set("LI-Glob:FK-EGun:Mode-Sel", PvValue::Scalar(1.0)));
    assert_eq!(fixtures::scalar(li.get("LI-Glob:FK-EGun:Mode-Sts")), 1.0);
    li.take_outputs();

    assert!(li.set("LI-Glob:FK-EGun:Mode-Sel", PvValue::Scalar(7.0)));
    assert_eq!(
        fixtures::pushed(&li.take_outputs(), "LI-Glob:FK-EGun:Mode-Sel"),
        Some(PvValue::Scalar(1.0))
    );
    li.update_state(false);
    let efficiency = li.transport_efficiency().expect("linac efficiency");
    let outcome = li
        .run_injection_cycle(va_stage::InjectionCycle::shot(0, fixtures::BUNCH_SEPARATION))
        .expect("cycle");
    assert_eq!(outcome.forward.expect("gun shot").charge, vec![1.0e-9 * efficiency]);
}

#[test]
fn delays_are_applied_and_forwarded() {
    let delays: BTreeMap<String, f64> = [("InjSept".to_string(), 1.0e-6)].into_iter().collect();

    let (mut tb, _clock) = fixtures::stage("TB");
    tb.handle_parameters(PhysicsParameters::UpdateDelays(delays.clone()));
    assert_eq!(tb.pulsed_magnet("InjSept").expect("septum").delay, 1.0e-6);
    let outputs = tb.take_outputs();
    assert_eq!(
        fixtures::pushed(&outputs, "TB-Fam:TI-InjSept:Delay-RB"),
        Some(PvValue::Scalar(1.0e-6))
    );
    assert!(outputs.iter().any(|output| matches!(
        output,
        StageOutput::ForwardParameters(PhysicsParameters::UpdateDelays(_))
    )));

    let (mut si, _clock) = fixtures::stage("SI");
    si.update_delays(&delays);
    assert!(!si.take_outputs().iter().any(|output| matches!(
        output,
        StageOutput::ForwardParameters(_)
    )));
}

#[test]
fn refresh_classes_cover_the_table() {
    let (mut si, _clock) = fixtures::stage("SI");
    si.update_state(false);
    let dynamic = si.pv_values(Refresh::Dynamic);
    assert!(dynamic
        .iter()
        .any(|(name, _)| name == "SI-Glob:DI-DCCT:Current-Mon"));
    let constants = si.pv_values(Refresh::Constant);
    assert_eq!(constants.len(), 1);
    assert_eq!(si.initial_values().len(), si.pv_table().len());
}
