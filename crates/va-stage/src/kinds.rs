//! Stage kinds and their behaviour tables.
//!
//! Each [`StageKind`] maps to a static [`KindHooks`] table. The controller
//! calls through the table for everything that differs between a linac, a
//! transport line, the booster and the storage ring.

use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use va_charge::{touschek_coefficient_from_reference, Lifetimes};
use va_core::units::{HOUR, TOUSCHEK_REFERENCE_CURRENT};
use va_core::{Discipline, PvName, PvValue, VaError};
use va_optics::{
    loss_fraction_in_line, loss_fraction_in_ring, CoordinateOffset, EfficiencyParameters,
    LinearOptics, TwissBoundary,
};

use crate::config::PulsedRole;
use crate::controller::{PhysicsCache, StageController};
use crate::cycle::{ratio, CycleOutcome, CycleStep, InjectionCycle};
use crate::devices::{reslot, KickerGuard, PulsedMagnet};
use crate::registry::{global_device, PvEntry, Refresh};

/// Behaviour family of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Linear accelerator with the electron gun.
    Linac,
    /// Single-pass transfer line.
    TransportLine,
    /// Ramping ring that injects, accelerates and extracts.
    Booster,
    /// Storage ring; the last stage of the pipeline.
    StorageRing,
}

impl StageKind {
    /// Behaviour table of the kind.
    pub fn hooks(self) -> &'static KindHooks {
        match self {
            StageKind::Linac => &LINAC,
            StageKind::TransportLine => &TRANSPORT_LINE,
            StageKind::Booster => &BOOSTER,
            StageKind::StorageRing => &STORAGE_RING,
        }
    }

    /// Returns `true` for circular machines.
    pub fn is_ring(self) -> bool {
        matches!(self, StageKind::Booster | StageKind::StorageRing)
    }
}

/// Kind-specific callbacks of a stage.
pub struct KindHooks {
    /// Recomputes the cached physics; an error dumps the beam.
    pub refresh_physics: fn(&mut StageController) -> Result<(), VaError>,
    /// Injection efficiency, `None` while its inputs are missing.
    pub compute_injection_efficiency: fn(&mut StageController) -> Option<f64>,
    /// Extraction efficiency, `None` while its inputs are missing.
    pub compute_ejection_efficiency: fn(&mut StageController) -> Option<f64>,
    /// Transforms an incoming cycle into the outgoing one.
    pub run_cycle: fn(&mut StageController, InjectionCycle) -> Result<CycleOutcome, VaError>,
    /// Reads kind-specific PVs.
    pub extra_get: fn(&mut StageController, &PvName) -> Option<PvValue>,
    /// Writes kind-specific PVs.
    pub extra_set: fn(&mut StageController, &PvName, f64) -> bool,
    /// Kind-specific PV table for a prefix.
    pub extra_pvs: fn(&str) -> Vec<PvEntry>,
}

static LINAC: KindHooks = KindHooks {
    refresh_physics: refresh_line,
    compute_injection_efficiency: no_efficiency,
    compute_ejection_efficiency: no_efficiency,
    run_cycle: linac_cycle,
    extra_get: linac_get,
    extra_set: linac_set,
    extra_pvs: linac_pvs,
};

static TRANSPORT_LINE: KindHooks = KindHooks {
    refresh_physics: refresh_line,
    compute_injection_efficiency: no_efficiency,
    compute_ejection_efficiency: no_efficiency,
    run_cycle: transport_line_cycle,
    extra_get: no_extra_get,
    extra_set: no_extra_set,
    extra_pvs: no_extra_pvs,
};

static BOOSTER: KindHooks = KindHooks {
    refresh_physics: refresh_ring,
    compute_injection_efficiency: booster_injection,
    compute_ejection_efficiency: booster_ejection,
    run_cycle: booster_cycle,
    extra_get: booster_get,
    extra_set: booster_set,
    extra_pvs: booster_pvs,
};

static STORAGE_RING: KindHooks = KindHooks {
    refresh_physics: refresh_ring,
    compute_injection_efficiency: storage_ring_injection,
    compute_ejection_efficiency: no_efficiency,
    run_cycle: storage_ring_cycle,
    extra_get: no_extra_get,
    extra_set: no_extra_set,
    extra_pvs: no_extra_pvs,
};

fn no_efficiency(_: &mut StageController) -> Option<f64> {
    None
}

fn no_extra_get(_: &mut StageController, _: &PvName) -> Option<PvValue> {
    None
}

fn no_extra_set(_: &mut StageController, _: &PvName, _: f64) -> bool {
    false
}

fn no_extra_pvs(_: &str) -> Vec<PvEntry> {
    Vec::new()
}

/// Transport efficiency of a line from its own source or the upstream beam.
fn refresh_line(stage: &mut StageController) -> Result<(), VaError> {
    let beam = match (&stage.config.source, &stage.upstream) {
        (Some(source), _) => source.parameters(),
        (None, Some(upstream)) => upstream.clone(),
        (None, None) => {
            debug!(stage = %stage.config.prefix, "no upstream beam");
            stage.transport_efficiency = None;
            stage.cache = PhysicsCache::default();
            stage.withdraw();
            return Ok(());
        }
    };
    let params = beam.with_offset(stage.config.coordinate_offset);
    let loss = loss_fraction_in_line(stage.engine.as_ref(), &stage.lattice, &params)
        .map_err(|err| err.with_context("step", "transport-efficiency"))?;
    let efficiency = loss.efficiency();
    stage.transport_efficiency = Some(efficiency);
    match loss.twiss {
        Some(table) => {
            let exit = table.last().copied().unwrap_or(params.init_twiss);
            stage.cache.orbit = Some(table.orbit());
            stage.cache.optics = Some(LinearOptics {
                twiss: table,
                transfer_matrix: loss.transfer_matrix.unwrap_or_else(Matrix6::identity),
                tunes: None,
            });
            let mut next = params;
            next.init_twiss = exit;
            next.coordinate_offset = CoordinateOffset::default();
            next.apertures = None;
            stage.publish(next);
        }
        None => {
            stage.cache = PhysicsCache::default();
            stage.withdraw();
        }
    }
    info!(stage = %stage.config.prefix, efficiency_pct = efficiency * 100.0, "transport efficiency updated");
    Ok(())
}

/// Closed orbit, periodic optics, equilibrium and lifetimes, in that order.
fn refresh_ring(stage: &mut StageController) -> Result<(), VaError> {
    stage.cache = PhysicsCache::default();
    let engine = stage.engine.as_ref();
    let lattice = &stage.lattice;
    let orbit = engine
        .find_closed_orbit(lattice)
        .map_err(|err| err.with_context("step", "closed-orbit"))?;
    let optics = engine
        .compute_twiss_and_transfer_matrix(lattice, TwissBoundary::Periodic(&orbit))
        .map_err(|err| err.with_context("step", "optics"))?;
    let equilibrium = engine
        .compute_equilibrium_parameters(lattice, &optics.twiss)
        .map_err(|err| err.with_context("step", "equilibrium"))?;
    let lifetimes = engine
        .compute_lifetimes_from_lattice(lattice, &optics.twiss, &equilibrium, &stage.config.gas)
        .map_err(|err| err.with_context("step", "lifetimes"))?;

    let touschek_coefficient = touschek_coefficient_from_reference(
        stage.config.touschek_reference_lifetime,
        TOUSCHEK_REFERENCE_CURRENT,
        equilibrium.revolution_period,
    );
    stage.ledger.set_lifetimes(
        Lifetimes {
            elastic: lifetimes.elastic,
            inelastic: lifetimes.inelastic,
            quantum: lifetimes.quantum,
            touschek_coefficient,
        }
        .into(),
    );
    if let Some(tunes) = optics.tunes {
        debug!(stage = %stage.config.prefix, tune_x = tunes[0], tune_y = tunes[1], "tunes");
    }
    info!(
        stage = %stage.config.prefix,
        elastic_h = lifetimes.elastic / HOUR,
        inelastic_h = lifetimes.inelastic / HOUR,
        quantum_h = lifetimes.quantum / HOUR,
        touschek_h = stage.ledger.touschek_lifetime() / HOUR,
        total_h = stage.ledger.total_lifetime() / HOUR,
        "lifetimes updated"
    );
    stage.cache = PhysicsCache {
        orbit: Some(orbit),
        optics: Some(optics),
        equilibrium: Some(equilibrium),
        lifetimes: Some(lifetimes),
    };
    Ok(())
}

fn booster_injection(stage: &mut StageController) -> Option<f64> {
    ring_injection(stage, |magnet| magnet.role == PulsedRole::InjectionKicker)
}

/// Exactly one of the non-linear and on-axis kickers may be enabled.
fn storage_ring_injection(stage: &mut StageController) -> Option<f64> {
    let kickers: Vec<String> = stage
        .devices
        .pulsed_magnets
        .values()
        .filter(|magnet| {
            magnet.enabled
                && matches!(
                    magnet.role,
                    PulsedRole::NonLinearKicker | PulsedRole::InjectionKicker
                )
        })
        .map(|magnet| magnet.family.clone())
        .collect();
    match kickers.as_slice() {
        [family] => {
            let family = family.clone();
            ring_injection(stage, |magnet| magnet.family == family)
        }
        _ => {
            stage.upstream.as_ref()?;
            warn!(stage = %stage.config.prefix, enabled = kickers.len(), "exactly one injection kicker must be enabled");
            Some(0.0)
        }
    }
}

fn ring_injection(
    stage: &mut StageController,
    kicker: impl Fn(&PulsedMagnet) -> bool,
) -> Option<f64> {
    stage.cache.lifetimes.as_ref()?;
    let params = stage
        .upstream
        .clone()?
        .with_offset(stage.config.coordinate_offset);
    let guard = KickerGuard::engage(
        &mut stage.lattice,
        stage.devices.pulsed_magnets.values().filter(|magnet| kicker(magnet)),
    );
    let loss = loss_fraction_in_ring(stage.engine.as_ref(), &guard, &params);
    drop(guard);
    match loss {
        Ok(loss) => Some(1.0 - loss),
        Err(err) => {
            warn!(stage = %stage.config.prefix, error = %err, "injection efficiency unavailable");
            Some(0.0)
        }
    }
}

/// Extraction line from the ejection kicker to the extraction point, at extraction energy.
fn booster_ejection(stage: &mut StageController) -> Option<f64> {
    let ejection = stage.config.ejection.clone()?;
    let optics = stage.cache.optics.clone()?;
    let Some(end) = stage.lattice.first_index(&ejection.extraction_point) else {
        warn!(stage = %stage.config.prefix, family = %ejection.extraction_point, "extraction point not in lattice");
        return Some(0.0);
    };
    let start = stage
        .devices
        .pulsed_magnets
        .values()
        .filter(|magnet| magnet.role == PulsedRole::EjectionKicker)
        .map(PulsedMagnet::position)
        .min()
        .unwrap_or(0);
    if start > end {
        warn!(stage = %stage.config.prefix, start, end, "ejection kicker downstream of the extraction point");
        return Some(0.0);
    }

    let mut ramped = stage.lattice.clone();
    ramped.energy = ejection.energy;
    let equilibrium = match stage
        .engine
        .compute_equilibrium_parameters(&ramped, &optics.twiss)
    {
        Ok(equilibrium) => equilibrium,
        Err(err) => {
            warn!(stage = %stage.config.prefix, error = %err, "no equilibrium at extraction energy");
            return Some(0.0);
        }
    };
    let seed = optics.twiss.get(start).copied()?;
    let params = EfficiencyParameters::new(
        equilibrium.emittance,
        equilibrium.energy_spread,
        stage.config.gas.coupling,
        seed,
    );

    let line = {
        let guard = KickerGuard::engage(
            &mut stage.lattice,
            stage
                .devices
                .pulsed_magnets
                .values()
                .filter(|magnet| magnet.role == PulsedRole::EjectionKicker),
        );
        let mut line = guard.segment(start..end + 1);
        line.energy = ejection.energy;
        line
    };
    let loss = match loss_fraction_in_line(stage.engine.as_ref(), &line, &params) {
        Ok(loss) => loss,
        Err(err) => {
            warn!(stage = %stage.config.prefix, error = %err, "ejection efficiency unavailable");
            return Some(0.0);
        }
    };
    if let Some(exit) = loss.twiss.as_ref().and_then(|table| table.last()).copied() {
        let mut next = params;
        next.init_twiss = exit;
        stage.publish(next);
    }
    Some(loss.efficiency())
}

/// Applies the flat-top window of every magnet in beam order.
fn timing_pass<'m>(
    magnets: impl IntoIterator<Item = &'m PulsedMagnet>,
    charge: Vec<f64>,
    charge_time: &[f64],
    master_delay: f64,
) -> Vec<f64> {
    let mut ordered: Vec<&PulsedMagnet> = magnets.into_iter().collect();
    ordered.sort_by_key(|magnet| magnet.position());
    ordered.into_iter().fold(charge, |charge, magnet| {
        magnet.timing_pass(&charge, charge_time, master_delay)
    })
}

fn scale(charge: &mut [f64], factor: f64) {
    charge.iter_mut().for_each(|q| *q *= factor);
}

fn linac_cycle(
    stage: &mut StageController,
    cycle: InjectionCycle,
) -> Result<CycleOutcome, VaError> {
    let prefix = stage.config.prefix.clone();
    if !stage.egun.enabled {
        info!(stage = %prefix, "electron gun disabled, cycle stopped");
        return Ok(CycleOutcome::stopped(prefix, cycle.total_charge()));
    }
    let mut charge = if cycle.charge.is_empty() {
        stage.egun.bunch_train()
    } else {
        cycle.charge.clone()
    };
    let charge_time: Vec<f64> = (0..charge.len())
        .map(|i| (cycle.injection_bunch as f64 + i as f64) * cycle.bunch_separation + stage.egun.delay)
        .collect();
    let received: f64 = charge.iter().sum();
    let efficiency = stage.transport_efficiency.unwrap_or(0.0);
    scale(&mut charge, efficiency);
    let delivered: f64 = charge.iter().sum();
    Ok(CycleOutcome {
        prefix,
        received,
        delivered,
        steps: vec![CycleStep::new("transport", efficiency)],
        forward: Some(InjectionCycle {
            charge,
            charge_time,
            ejection_efficiency: None,
            ..cycle
        }),
    })
}

fn transport_line_cycle(
    stage: &mut StageController,
    cycle: InjectionCycle,
) -> Result<CycleOutcome, VaError> {
    let received = cycle.total_charge();
    let mut charge = timing_pass(
        stage.devices.pulsed_magnets.values(),
        cycle.charge.clone(),
        &cycle.charge_time,
        cycle.master_delay,
    );
    let mut steps = vec![CycleStep::new("timing", ratio(received, charge.iter().sum()))];

    let transport = stage.transport_efficiency.unwrap_or(0.0);
    scale(&mut charge, transport);
    steps.push(CycleStep::new("transport", transport));
    if let Some(ejection) = cycle.ejection_efficiency {
        scale(&mut charge, ejection);
        steps.push(CycleStep::new("ejection", ejection));
    }
    let delivered: f64 = charge.iter().sum();
    Ok(CycleOutcome {
        prefix: stage.config.prefix.clone(),
        received,
        delivered,
        steps,
        forward: Some(InjectionCycle {
            charge,
            ejection_efficiency: None,
            ..cycle
        }),
    })
}

/// Moves the incoming charge into ring buckets through the injection kicker's time origin.
fn reslot_into_ring(
    stage: &StageController,
    cycle: &InjectionCycle,
    roles: &[PulsedRole],
) -> Result<(Vec<f64>, Vec<f64>), VaError> {
    if !(cycle.bunch_separation > 0.0) {
        return Err(VaError::config(
            "bunch-separation",
            "bunch separation must be positive to re-slot charge",
        )
        .with_context("bunch_separation", cycle.bunch_separation.to_string()));
    }
    let origin = roles
        .iter()
        .find_map(|role| {
            stage
                .devices
                .pulsed_magnets
                .values()
                .find(|magnet| magnet.role == *role)
        })
        .map_or(0.0, PulsedMagnet::slot_origin);
    Ok(reslot(
        &cycle.charge,
        &cycle.charge_time,
        origin,
        cycle.bunch_separation,
        stage.lattice.harmonic_number,
    ))
}

fn booster_cycle(
    stage: &mut StageController,
    cycle: InjectionCycle,
) -> Result<CycleOutcome, VaError> {
    let prefix = stage.config.prefix.clone();
    let received = cycle.total_charge();
    if stage.cache.equilibrium.is_none() || stage.cache.lifetimes.is_none() {
        info!(stage = %prefix, "no equilibrium, cycle stopped");
        return Ok(CycleOutcome::stopped(prefix, received));
    }
    let (charge, charge_time) = reslot_into_ring(stage, &cycle, &[PulsedRole::InjectionKicker])?;
    let charge = timing_pass(
        stage
            .devices
            .pulsed_magnets
            .values()
            .filter(|magnet| magnet.role != PulsedRole::EjectionKicker),
        charge,
        &charge_time,
        cycle.master_delay,
    );
    let mut steps = vec![CycleStep::new("timing", ratio(received, charge.iter().sum()))];

    let injection = stage.injection_efficiency.unwrap_or(0.0);
    let mut injected = charge;
    scale(&mut injected, injection);
    steps.push(CycleStep::new("injection", injection));
    stage.ledger.inject(&injected);
    stage.state_changed = true;

    if !stage.ramp.enabled {
        stage.ledger.dump();
        info!(stage = %prefix, "ramp disabled, beam dumped");
        steps.push(CycleStep::new("ramp", 0.0));
        return Ok(CycleOutcome {
            prefix,
            received,
            delivered: 0.0,
            steps,
            forward: None,
        });
    }

    let stored = stage.ledger.eject();
    let ejected: f64 = stored.iter().sum();
    let charge = timing_pass(
        stage
            .devices
            .pulsed_magnets
            .values()
            .filter(|magnet| magnet.role == PulsedRole::EjectionKicker),
        stored,
        &charge_time,
        cycle.master_delay,
    );
    steps.push(CycleStep::new("ejection-timing", ratio(ejected, charge.iter().sum())));
    let delivered: f64 = charge.iter().sum();
    Ok(CycleOutcome {
        prefix,
        received,
        delivered,
        steps,
        forward: Some(InjectionCycle {
            charge,
            charge_time,
            ejection_efficiency: Some(stage.ejection_efficiency.unwrap_or(0.0)),
            ..cycle
        }),
    })
}

fn storage_ring_cycle(
    stage: &mut StageController,
    cycle: InjectionCycle,
) -> Result<CycleOutcome, VaError> {
    let received = cycle.total_charge();
    let (charge, charge_time) = reslot_into_ring(
        stage,
        &cycle,
        &[PulsedRole::InjectionKicker, PulsedRole::NonLinearKicker],
    )?;
    let charge = timing_pass(
        stage.devices.pulsed_magnets.values().filter(|magnet| magnet.enabled),
        charge,
        &charge_time,
        cycle.master_delay,
    );
    let mut steps = vec![CycleStep::new("timing", ratio(received, charge.iter().sum()))];
    let injection = stage.injection_efficiency.unwrap_or(0.0);
    let mut injected = charge;
    scale(&mut injected, injection);
    steps.push(CycleStep::new("injection", injection));
    stage.ledger.inject(&injected);
    stage.state_changed = true;
    Ok(CycleOutcome {
        prefix: stage.config.prefix.clone(),
        received,
        delivered: injected.iter().sum(),
        steps,
        forward: None,
    })
}

fn setpoint_pair(device: &str, property: &str) -> [PvEntry; 2] {
    [
        PvEntry::new(format!("{device}:{property}-SP"), Refresh::Setpoint),
        PvEntry::new(format!("{device}:{property}-RB"), Refresh::Setpoint),
    ]
}

fn linac_pvs(prefix: &str) -> Vec<PvEntry> {
    let gun = global_device(prefix, "TI-EGun");
    let mode = global_device(prefix, "FK-EGun");
    let mut entries = Vec::new();
    entries.extend(setpoint_pair(&gun, "Enbl"));
    entries.extend(setpoint_pair(&gun, "Delay"));
    entries.push(PvEntry::new(format!("{mode}:Mode-Sel"), Refresh::Setpoint));
    entries.push(PvEntry::new(format!("{mode}:Mode-Sts"), Refresh::Setpoint));
    entries
}

fn linac_get(stage: &mut StageController, pv: &PvName) -> Option<PvValue> {
    if pv.device != "EGun" {
        return None;
    }
    match (&pv.discipline, pv.property_with_suffix().as_str()) {
        (Discipline::TI, "Enbl-SP" | "Enbl-RB") => Some(stage.egun.enabled.into()),
        (Discipline::TI, "Delay-SP" | "Delay-RB") => Some(stage.egun.delay.into()),
        (Discipline::FK, "Mode-Sel" | "Mode-Sts") => Some(stage.egun.single_bunch.into()),
        _ => None,
    }
}

/// Gun enable, delay and the single/multi-bunch selector (0 multi, 1 single).
fn linac_set(stage: &mut StageController, pv: &PvName, value: f64) -> bool {
    if pv.device != "EGun" {
        return false;
    }
    let applied: PvValue = match (&pv.discipline, pv.property_with_suffix().as_str()) {
        (Discipline::TI, "Enbl-SP") => {
            stage.egun.enabled = value != 0.0;
            stage.egun.enabled.into()
        }
        (Discipline::TI, "Delay-SP") => {
            stage.egun.delay = value;
            value.into()
        }
        (Discipline::FK, "Mode-Sel") => {
            if value != 0.0 && value != 1.0 {
                warn!(stage = %stage.config.prefix, value, "electron gun mode out of range");
                let previous = stage.egun.single_bunch;
                stage.push(pv.to_string(), previous);
                return true;
            }
            stage.egun.single_bunch = value == 1.0;
            stage.egun.single_bunch.into()
        }
        _ => return false,
    };
    stage.push_readback(pv, applied);
    true
}

fn booster_pvs(prefix: &str) -> Vec<PvEntry> {
    let ramp = global_device(prefix, "TI-RampPS");
    let mut entries = Vec::new();
    entries.extend(setpoint_pair(&ramp, "Enbl"));
    entries.extend(setpoint_pair(&ramp, "Delay"));
    entries
}

fn booster_get(stage: &mut StageController, pv: &PvName) -> Option<PvValue> {
    if pv.discipline != Discipline::TI || pv.device != "RampPS" {
        return None;
    }
    match pv.property_with_suffix().as_str() {
        "Enbl-SP" | "Enbl-RB" => Some(stage.ramp.enabled.into()),
        "Delay-SP" | "Delay-RB" => Some(stage.ramp.delay.into()),
        _ => None,
    }
}

fn booster_set(stage: &mut StageController, pv: &PvName, value: f64) -> bool {
    if pv.discipline != Discipline::TI || pv.device != "RampPS" {
        return false;
    }
    let applied: PvValue = match pv.property_with_suffix().as_str() {
        "Enbl-SP" => {
            stage.ramp.enabled = value != 0.0;
            stage.ramp.enabled.into()
        }
        "Delay-SP" => {
            stage.ramp.delay = value;
            value.into()
        }
        _ => return false,
    };
    stage.push_readback(pv, applied);
    true
}
