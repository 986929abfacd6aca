use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use va_server::commands::{cycle, defaults, pvs, run};
use va_server::{load_server_config, ServerConfig};

fn write_config(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("server.yaml");
    fs::write(&path, text).expect("write config");
    path
}

#[test]
fn default_config_round_trips_through_the_config_command() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("defaults.yaml");
    let text = defaults::run(&defaults::ConfigArgs {
        out: Some(path.clone()),
    })
    .expect("config command");
    assert_eq!(fs::read_to_string(&path).expect("written"), text);

    let loaded = load_server_config(&path).expect("load");
    assert_eq!(loaded, ServerConfig::default());
}

#[test]
fn shipped_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/server.yaml");
    let config = load_server_config(&path).expect("shipped config");
    assert_eq!(config.interval_ms, 100);
    assert_eq!(config.fluctuations.len(), 3);
    assert_eq!(config.machine.timing.increment, 1);
    assert_eq!(config.machine.stages.len(), 5);
    let table = config.fluctuation_table().expect("fluctuations");
    assert_eq!(table.sigma_for("SI-01:DI-BPM:PosX-Mon"), Some(50.0));
}

#[test]
fn invalid_configs_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");

    let path = write_config(dir.path(), "interval_ms: 0\n");
    let err = load_server_config(&path).expect_err("zero interval");
    assert_eq!(err.info().code, "interval");

    let path = write_config(dir.path(), "fluctuations:\n  - pattern: \"SI-[\"\n    sigma: 1.0\n");
    let config = load_server_config(&path).expect("patterns compile lazily");
    let err = config.fluctuation_table().expect_err("bad glob");
    assert_eq!(err.info().code, "fluctuation-pattern");

    let err = load_server_config(&dir.path().join("missing.yaml")).expect_err("missing file");
    assert_eq!(err.info().code, "server-config-read");
}

#[test]
fn cycle_command_reports_the_pipeline() {
    let report = cycle::run(&cycle::CycleArgs {
        config: None,
        charge_nc: Some(1.0),
        bunches: 4,
    })
    .expect("cycle");
    assert_eq!(report.stages[0].prefix, "LI");
    assert!((report.initial_charge - 1.0e-9).abs() < 1.0e-18);
    assert!((0.0..=1.0).contains(&report.efficiency));
    assert!(report.final_charge <= report.initial_charge);
}

#[test]
fn cycle_command_checks_its_charge() {
    let err = cycle::run(&cycle::CycleArgs {
        config: None,
        charge_nc: Some(-1.0),
        bunches: 1,
    })
    .expect_err("negative charge");
    assert_eq!(err.info().code, "charge");

    let err = cycle::run(&cycle::CycleArgs {
        config: None,
        charge_nc: Some(1.0),
        bunches: 0,
    })
    .expect_err("no bunches");
    assert_eq!(err.info().code, "bunches");
}

#[test]
fn pvs_command_lists_every_area() {
    let entries = pvs::run(&pvs::PvsArgs { config: None }).expect("pvs");
    let names: BTreeSet<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names.len(), entries.len());
    for pv in [
        "AS-Glob:TI-Cycle:Start-Cmd",
        "LI-Glob:TI-EGun:Enbl-SP",
        "SI-Glob:DI-DCCT:Current-Mon",
        "BO-Glob:TI-RampPS:Enbl-SP",
    ] {
        assert!(names.contains(pv), "{pv}");
    }
}

#[test]
fn run_command_returns_a_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), "interval_ms: 10\n");
    let values = run::run(&run::RunArgs {
        config: Some(path),
        seconds: 0.3,
        cycles: 1,
    })
    .expect("run");
    assert!(values.contains_key("AS-Glob:TI-Cycle:InjBun-RB"));
    assert!(values.contains_key("SI-Glob:DI-DCCT:Current-Mon"));

    let err = run::run(&run::RunArgs {
        config: None,
        seconds: f64::NAN,
        cycles: 0,
    })
    .expect_err("bad duration");
    assert_eq!(err.info().code, "seconds");
}
