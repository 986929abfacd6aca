//! Stage controller: PV dispatch, lazy physics refresh and beam dumps.
//!
//! One [`StageController`] drives one accelerator section. Kind-specific
//! behaviour (linac gun, booster ramp, ring lifetimes, ...) is looked up in
//! the [`KindHooks`](crate::kinds::KindHooks) table of the stage kind; the
//! dispatch skeleton and the dirty-flag bookkeeping live here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use va_charge::ChargeLedger;
use va_core::units::{METER_TO_NANOMETER, MILLI_AMPERE};
use va_core::{Clock, Discipline, PvName, PvValue, VaError, UNDEF_VALUE};
use va_optics::{
    EfficiencyParameters, ElementKind, EquilibriumSummary, Lattice, LatticeLifetimes,
    LinearOptics, OpticsEngine, PhaseSpace,
};

use crate::config::{EGunConfig, RampConfig, StageConfig};
use crate::cycle::{CycleOutcome, InjectionCycle, PhysicsParameters};
use crate::devices::PulsedMagnet;
use crate::kinds::StageKind;
use crate::registry::{timing_device, DeviceRegistry, Devices, PvEntry, Refresh};

/// Externally visible state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Cached physics matches the settings.
    Clean,
    /// A setting changed since the last refresh.
    Dirty,
    /// The last refresh failed; the beam was dumped and derived values are undefined.
    BeamLost,
}

/// Derived physics of the last successful refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicsCache {
    /// Closed orbit (rings) or trajectory (lines), `N + 1` points.
    pub orbit: Option<Vec<PhaseSpace>>,
    /// Twiss table, transfer matrix and tunes.
    pub optics: Option<LinearOptics>,
    /// Radiation equilibrium (rings).
    pub equilibrium: Option<EquilibriumSummary>,
    /// Gas and quantum lifetimes (rings).
    pub lifetimes: Option<LatticeLifetimes>,
}

/// Side effects a stage asks its worker to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// New value for the PV database.
    PushPv {
        /// PV name.
        name: String,
        /// Value to publish.
        value: PvValue,
    },
    /// Parameters for the downstream stage.
    ForwardParameters(PhysicsParameters),
}

type Getter = fn(&mut StageController, &PvName) -> Option<PvValue>;
type Setter = fn(&mut StageController, &PvName, f64) -> bool;

const GETTERS: [Getter; 5] = [
    StageController::get_dynamic,
    StageController::get_kind_extra,
    StageController::get_fake,
    StageController::get_static,
    StageController::get_timing,
];

const SETTERS: [Setter; 7] = [
    StageController::set_beam,
    StageController::set_magnet,
    StageController::set_dcct,
    StageController::set_rf,
    StageController::set_fake,
    StageController::set_timing,
    StageController::set_kind_extra,
];

/// One accelerator stage.
pub struct StageController {
    pub(crate) config: StageConfig,
    pub(crate) registry: DeviceRegistry,
    pub(crate) lattice: Lattice,
    pub(crate) engine: Box<dyn OpticsEngine>,
    pub(crate) ledger: ChargeLedger,
    pub(crate) devices: Devices,
    pub(crate) cache: PhysicsCache,
    pub(crate) revolution_period: f64,
    pub(crate) dirty: bool,
    pub(crate) beam_lost: bool,
    pub(crate) state_changed: bool,
    pub(crate) transport_stale: bool,
    pub(crate) injection_stale: bool,
    pub(crate) ejection_stale: bool,
    pub(crate) upstream: Option<EfficiencyParameters>,
    pub(crate) latest: Option<EfficiencyParameters>,
    pub(crate) transport_efficiency: Option<f64>,
    pub(crate) injection_efficiency: Option<f64>,
    pub(crate) ejection_efficiency: Option<f64>,
    pub(crate) dcct_threshold: f64,
    pub(crate) egun: EGunConfig,
    pub(crate) ramp: RampConfig,
    pub(crate) outputs: Vec<StageOutput>,
}

impl fmt::Debug for StageController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageController")
            .field("prefix", &self.config.prefix)
            .field("kind", &self.config.kind)
            .field("state", &self.state())
            .field("pvs", &self.registry.len())
            .finish()
    }
}

impl StageController {
    /// Builds the stage; physics is computed on the first [`update_state`](Self::update_state).
    pub fn new(
        config: StageConfig,
        engine: Box<dyn OpticsEngine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaError> {
        let built = config
            .lattice
            .build()
            .map_err(|err| err.with_context("stage", config.prefix.clone()))?;
        let (mut lattice, origin) = match config.injection_point.as_deref() {
            Some(family) => match built.first_index(family) {
                Some(start) => {
                    let len = built.len();
                    (built.rotated(start), (len - start) % len)
                }
                None => {
                    warn!(stage = %config.prefix, family, "injection point not in lattice, ring kept unrotated");
                    (built, 0)
                }
            },
            None => (built, 0),
        };
        let (registry, devices) = DeviceRegistry::build(&config, &mut lattice, origin);
        let ledger = ChargeLedger::new(config.bunch_count(), clock)
            .map_err(|err| err.with_context("stage", config.prefix.clone()))?;
        let revolution_period = lattice.revolution_period();
        debug!(
            stage = %config.prefix,
            elements = lattice.len(),
            pvs = registry.len(),
            bunches = ledger.nr_bunches(),
            "stage built"
        );
        Ok(Self {
            egun: config.egun.clone().unwrap_or_default(),
            ramp: config.ramp.clone().unwrap_or_default(),
            config,
            registry,
            lattice,
            engine,
            ledger,
            devices,
            cache: PhysicsCache::default(),
            revolution_period,
            dirty: true,
            beam_lost: false,
            state_changed: false,
            transport_stale: true,
            injection_stale: true,
            ejection_stale: true,
            upstream: None,
            latest: None,
            transport_efficiency: None,
            injection_efficiency: None,
            ejection_efficiency: None,
            dcct_threshold: 0.0,
            outputs: Vec::new(),
        })
    }

    /// Section prefix.
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Stage kind.
    pub fn kind(&self) -> StageKind {
        self.config.kind
    }

    /// Configuration the stage was built from.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// PV table and element lookups.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Lattice with the present magnet settings.
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Cached physics.
    pub fn cache(&self) -> &PhysicsCache {
        &self.cache
    }

    /// Charge ledger.
    pub fn ledger(&self) -> &ChargeLedger {
        &self.ledger
    }

    /// Up-to-date charge per bunch [C].
    pub fn charges(&mut self) -> Vec<f64> {
        self.ledger.current_charges()
    }

    /// Up-to-date stored charge [C].
    pub fn total_charge(&mut self) -> f64 {
        self.ledger.total_charge()
    }

    /// Revolution period of the lattice [s].
    pub fn revolution_period(&self) -> f64 {
        self.revolution_period
    }

    /// Pulsed magnet of `family`.
    pub fn pulsed_magnet(&self, family: &str) -> Option<&PulsedMagnet> {
        self.devices.pulsed_magnets.get(family)
    }

    /// Transmission of a line stage.
    pub fn transport_efficiency(&self) -> Option<f64> {
        self.transport_efficiency
    }

    /// Injection efficiency of a ring stage.
    pub fn injection_efficiency(&self) -> Option<f64> {
        self.injection_efficiency
    }

    /// Extraction efficiency of the booster.
    pub fn ejection_efficiency(&self) -> Option<f64> {
        self.ejection_efficiency
    }

    /// Present state.
    pub fn state(&self) -> StageState {
        if self.dirty {
            StageState::Dirty
        } else if self.beam_lost {
            StageState::BeamLost
        } else {
            StageState::Clean
        }
    }

    /// Beam bundle published by the most recent completed refresh.
    pub fn latest_parameters(&self) -> Option<&EfficiencyParameters> {
        self.latest.as_ref()
    }

    /// Stores upstream beam parameters and marks the depending efficiency stale.
    ///
    /// The optics cache is left untouched.
    pub fn receive_parameters(&mut self, parameters: EfficiencyParameters) {
        self.upstream = Some(parameters);
        if self.kind().is_ring() {
            self.injection_stale = true;
        } else {
            self.transport_stale = true;
        }
    }

    /// Applies a parameter message from upstream.
    pub fn handle_parameters(&mut self, parameters: PhysicsParameters) {
        match parameters {
            PhysicsParameters::Injection(parameters) => self.receive_parameters(parameters),
            PhysicsParameters::UpdateDelays(delays) => self.update_delays(&delays),
            PhysicsParameters::Withdrawn => self.withdraw_upstream(),
        }
    }

    /// Forgets the upstream beam; the depending efficiency becomes unknown.
    pub fn withdraw_upstream(&mut self) {
        if self.upstream.take().is_none() {
            return;
        }
        debug!(stage = %self.config.prefix, "upstream beam withdrawn");
        if self.kind().is_ring() {
            self.injection_stale = true;
        } else {
            self.transport_stale = true;
        }
    }

    /// Sets the delay of every listed pulsed magnet of this stage.
    ///
    /// The map is forwarded downstream unless this is the storage ring.
    pub fn update_delays(&mut self, delays: &BTreeMap<String, f64>) {
        let mut applied = Vec::new();
        for (family, &delay) in delays {
            if let Some(magnet) = self.devices.pulsed_magnets.get_mut(family) {
                magnet.delay = delay;
                applied.push((timing_device(&self.config.prefix, family), delay));
            }
        }
        for (device, delay) in applied {
            self.push(format!("{device}:Delay-SP"), delay);
            self.push(format!("{device}:Delay-RB"), delay);
        }
        if self.kind() != StageKind::StorageRing {
            self.outputs.push(StageOutput::ForwardParameters(PhysicsParameters::UpdateDelays(
                delays.clone(),
            )));
        }
    }

    /// Reads a PV; `None` when no dispatcher knows the name.
    pub fn get(&mut self, name: &str) -> Option<PvValue> {
        let pv = match PvName::parse(name) {
            Ok(pv) => pv,
            Err(err) => {
                warn!(stage = %self.config.prefix, error = %err, "cannot read pv");
                return None;
            }
        };
        let value = GETTERS.iter().find_map(|getter| getter(self, &pv));
        if value.is_none() {
            warn!(stage = %self.config.prefix, pv = name, "pv not handled");
        }
        value
    }

    /// Writes a PV; returns `true` when a dispatcher handled it.
    pub fn set(&mut self, name: &str, value: PvValue) -> bool {
        let pv = match PvName::parse(name) {
            Ok(pv) => pv,
            Err(err) => {
                warn!(stage = %self.config.prefix, error = %err, "cannot write pv");
                return false;
            }
        };
        let Some(scalar) = value.as_scalar().filter(|v| v.is_finite()) else {
            warn!(stage = %self.config.prefix, pv = name, ?value, "write rejected, value is not a finite number");
            return false;
        };
        let handled = SETTERS.iter().any(|setter| setter(self, &pv, scalar));
        if !handled {
            warn!(stage = %self.config.prefix, pv = name, "pv not handled");
        }
        handled
    }

    /// Refreshes stale physics and efficiencies.
    ///
    /// A failing refresh dumps the beam; the stage then reports
    /// [`StageState::BeamLost`] until the next optics-affecting write.
    pub fn update_state(&mut self, force: bool) -> StageState {
        let hooks = self.kind().hooks();
        let line_stale = !self.kind().is_ring() && self.transport_stale;
        if self.dirty || force || line_stale {
            debug!(stage = %self.config.prefix, force, dirty = self.dirty, "refreshing physics");
            let result = (hooks.refresh_physics)(self);
            self.dirty = false;
            self.transport_stale = false;
            match result {
                Ok(()) => {
                    self.beam_lost = false;
                    self.state_changed = true;
                    self.injection_stale = true;
                    self.ejection_stale = true;
                }
                Err(err) => self.beam_dump(&err.to_string()),
            }
        }
        if !self.beam_lost {
            if self.injection_stale {
                self.injection_stale = false;
                self.injection_efficiency = (hooks.compute_injection_efficiency)(self);
                if let Some(efficiency) = self.injection_efficiency {
                    info!(stage = %self.config.prefix, efficiency_pct = efficiency * 100.0, "injection efficiency updated");
                }
            }
            if self.ejection_stale {
                self.ejection_stale = false;
                self.ejection_efficiency = (hooks.compute_ejection_efficiency)(self);
                if let Some(efficiency) = self.ejection_efficiency {
                    info!(stage = %self.config.prefix, efficiency_pct = efficiency * 100.0, "ejection efficiency updated");
                }
            }
        }
        self.state()
    }

    /// Zeroes the ledger and forgets every derived quantity.
    pub fn beam_dump(&mut self, reason: &str) {
        self.ledger.dump();
        self.cache = PhysicsCache::default();
        self.transport_efficiency = None;
        self.injection_efficiency = None;
        self.ejection_efficiency = None;
        self.withdraw();
        self.beam_lost = true;
        self.state_changed = true;
        error!(stage = %self.config.prefix, reason, "beam dump");
    }

    /// Runs this stage's part of an injection cycle.
    pub fn run_injection_cycle(&mut self, cycle: InjectionCycle) -> Result<CycleOutcome, VaError> {
        self.update_state(false);
        let outcome = (self.kind().hooks().run_cycle)(self, cycle)
            .map_err(|err| err.with_context("stage", self.config.prefix.clone()))?;
        info!(
            stage = %self.config.prefix,
            received = outcome.received,
            delivered = outcome.delivered,
            efficiency_pct = outcome.efficiency() * 100.0,
            "injection cycle step"
        );
        Ok(outcome)
    }

    /// Drains pending pushes and forwards.
    pub fn take_outputs(&mut self) -> Vec<StageOutput> {
        std::mem::take(&mut self.outputs)
    }

    /// Returns and clears the "state changed" flag.
    pub fn take_state_changed(&mut self) -> bool {
        std::mem::replace(&mut self.state_changed, false)
    }

    /// Current values of every PV with the given refresh policy.
    pub fn pv_values(&mut self, refresh: Refresh) -> Vec<(String, PvValue)> {
        let names = self.registry.names_with(refresh);
        self.values_of(names)
    }

    /// Current values of every PV of the stage.
    pub fn initial_values(&mut self) -> Vec<(String, PvValue)> {
        let names: Vec<String> = self.registry.entries().map(|entry| entry.name.clone()).collect();
        self.values_of(names)
    }

    /// PV table of the stage.
    pub fn pv_table(&self) -> Vec<PvEntry> {
        self.registry.entries().cloned().collect()
    }

    fn values_of(&mut self, names: Vec<String>) -> Vec<(String, PvValue)> {
        names
            .into_iter()
            .filter_map(|name| self.get(&name).map(|value| (name, value)))
            .collect()
    }

    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<PvValue>) {
        self.outputs.push(StageOutput::PushPv {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Pushes the readback mirror of a setpoint when the stage exposes one.
    pub(crate) fn push_readback(&mut self, pv: &PvName, value: impl Into<PvValue>) {
        if let Some(readback) = pv.readback() {
            let name = readback.to_string();
            if self.registry.entry(&name).is_some() {
                self.push(name, value);
            }
        }
    }

    /// Retracts the published beam, telling the downstream neighbour once.
    pub(crate) fn withdraw(&mut self) {
        if self.latest.take().is_some() {
            self.outputs
                .push(StageOutput::ForwardParameters(PhysicsParameters::Withdrawn));
        }
    }

    pub(crate) fn publish(&mut self, parameters: EfficiencyParameters) {
        self.latest = Some(parameters.clone());
        self.outputs.push(StageOutput::ForwardParameters(PhysicsParameters::Injection(
            parameters,
        )));
    }

    fn get_dynamic(&mut self, pv: &PvName) -> Option<PvValue> {
        if !self.kind().is_ring() {
            return None;
        }
        let property = pv.property_with_suffix();
        let period = self.revolution_period;
        match (&pv.discipline, pv.device.as_str(), property.as_str()) {
            (Discipline::DI, "DCCT", "Current-Mon") => {
                let current = self.ledger.total_current(period) / MILLI_AMPERE;
                let shown = if current < self.dcct_threshold { 0.0 } else { current };
                Some(shown.into())
            }
            (Discipline::DI, "DCCT", "BbBCurrent-Mon") => Some(PvValue::Array(
                self.ledger
                    .currents(period)
                    .into_iter()
                    .map(|current| current / MILLI_AMPERE)
                    .collect(),
            )),
            (Discipline::AP, "CurrInfo", "CurrLT-Mon") => {
                Some(defined(self.ledger.total_lifetime()).into())
            }
            (Discipline::AP, "CurrInfo", "BbBCurrLT-Mon") => Some(PvValue::Array(
                self.ledger.per_bunch_lifetime().into_iter().map(defined).collect(),
            )),
            _ => None,
        }
    }

    fn get_kind_extra(&mut self, pv: &PvName) -> Option<PvValue> {
        (self.kind().hooks().extra_get)(self, pv)
    }

    fn get_fake(&mut self, pv: &PvName) -> Option<PvValue> {
        if pv.discipline != Discipline::FK {
            return None;
        }
        let family = family_of(pv);
        if !self.registry.is_fake_family(&family) {
            return None;
        }
        let element = self
            .registry
            .family_indices(&family)
            .first()
            .and_then(|&idx| self.lattice.elements.get(idx))?;
        match pv.property_with_suffix().as_str() {
            "ErrX-SP" => Some(element.dx.into()),
            "ErrY-SP" => Some(element.dy.into()),
            "ErrR-SP" => Some(element.roll.into()),
            _ => None,
        }
    }

    fn get_static(&mut self, pv: &PvName) -> Option<PvValue> {
        let property = pv.property_with_suffix();
        match pv.discipline {
            Discipline::PS => match property.as_str() {
                "Current-SP" | "Current-RB" => self
                    .devices
                    .power_supplies
                    .get(&pv.device_name())
                    .map(|supply| supply.current().into()),
                _ => None,
            },
            Discipline::PU => match property.as_str() {
                "Kick-SP" | "Kick-RB" => self
                    .devices
                    .pulsed_magnets
                    .get(&family_of(pv))
                    .map(|magnet| magnet.kick.into()),
                _ => None,
            },
            Discipline::DI => self.get_diagnostic(pv, &property),
            Discipline::RF if !self.registry.cavity_indices().is_empty() => {
                match property.as_str() {
                    "Volt-SP" | "Volt-RB" => Some(self.lattice.rf_voltage().into()),
                    "Freq-SP" | "Freq-RB" => {
                        Some(self.lattice.rf_frequency().unwrap_or(UNDEF_VALUE).into())
                    }
                    _ => None,
                }
            }
            Discipline::AP => Some(UNDEF_VALUE.into()),
            Discipline::MO if property == "BPMPos-Cte" => {
                Some(PvValue::Array(self.registry.bpm_positions().to_vec()))
            }
            Discipline::VA if pv.device == "Beam" => Some(0.0.into()),
            _ => None,
        }
    }

    fn get_diagnostic(&mut self, pv: &PvName, property: &str) -> Option<PvValue> {
        match pv.device.as_str() {
            "BPM" => {
                let idx = self.registry.bpm_index(&pv.device_name())?;
                let plane = match property {
                    "PosX-Mon" => 0,
                    "PosY-Mon" => 2,
                    _ => return None,
                };
                let no_beam =
                    self.kind() == StageKind::StorageRing && self.ledger.total_charge() == 0.0;
                let position = match &self.cache.orbit {
                    Some(orbit) if !no_beam => orbit
                        .get(idx)
                        .map_or(UNDEF_VALUE, |point| point[plane] * METER_TO_NANOMETER),
                    _ => UNDEF_VALUE,
                };
                Some(position.into())
            }
            "DCCT" => match property {
                "CurrThold" => Some(self.dcct_threshold.into()),
                "HwFlt-Mon" => Some(self.beam_lost.into()),
                _ => None,
            },
            "Tune" => {
                let tunes = self.cache.optics.as_ref().and_then(|optics| optics.tunes);
                let tune = match property {
                    "Freq1-Mon" => tunes.map(|tunes| tunes[0]),
                    "Freq2-Mon" => tunes.map(|tunes| tunes[1]),
                    "Freq3-Mon" => tunes.and(self.cache.equilibrium.map(|summary| summary.synchrotron_tune)),
                    _ => return None,
                };
                if self.ledger.total_charge() == 0.0 {
                    return Some(UNDEF_VALUE.into());
                }
                Some(tune.unwrap_or(UNDEF_VALUE).into())
            }
            _ => None,
        }
    }

    fn get_timing(&mut self, pv: &PvName) -> Option<PvValue> {
        if pv.discipline != Discipline::TI {
            return None;
        }
        let magnet = self.devices.pulsed_magnets.get(&family_of(pv))?;
        match pv.property_with_suffix().as_str() {
            "Enbl-SP" | "Enbl-RB" => Some(magnet.enabled.into()),
            "Delay-SP" | "Delay-RB" => Some(magnet.delay.into()),
            _ => None,
        }
    }

    fn set_beam(&mut self, pv: &PvName, value: f64) -> bool {
        if pv.discipline != Discipline::VA || pv.device != "Beam" || !self.kind().is_ring() {
            return false;
        }
        match pv.property_with_suffix().as_str() {
            "BeamCurrentAdd-SP" => {
                if value <= 0.0 {
                    warn!(stage = %self.config.prefix, value, "beam current to add must be positive");
                    return true;
                }
                let bunches = self.ledger.nr_bunches();
                let per_bunch = value * MILLI_AMPERE * self.revolution_period / bunches as f64;
                self.ledger.inject(&vec![per_bunch; bunches]);
                self.state_changed = true;
                info!(stage = %self.config.prefix, added_ma = value, "beam current added");
                true
            }
            "BeamCurrentDump-Cmd" => {
                let dumped: f64 = self.ledger.eject().iter().sum();
                self.state_changed = true;
                info!(stage = %self.config.prefix, dumped_charge = dumped, "beam dumped on request");
                true
            }
            _ => false,
        }
    }

    fn set_magnet(&mut self, pv: &PvName, value: f64) -> bool {
        let property = pv.property_with_suffix();
        match (&pv.discipline, property.as_str()) {
            (Discipline::PS, "Current-SP") => {
                let Some(supply) = self.devices.power_supplies.get_mut(&pv.device_name()) else {
                    return false;
                };
                let change = supply.set_current(value, &mut self.lattice);
                if change.changed {
                    self.dirty = true;
                }
                if change.clamped {
                    self.push(pv.to_string(), change.applied);
                }
                self.push_readback(pv, change.applied);
                true
            }
            (Discipline::PU, "Kick-SP") => {
                let Some(magnet) = self.devices.pulsed_magnets.get_mut(&family_of(pv)) else {
                    return false;
                };
                if magnet.kick != value {
                    magnet.kick = value;
                    self.injection_stale = true;
                    self.ejection_stale = true;
                }
                self.push_readback(pv, value);
                true
            }
            _ => false,
        }
    }

    fn set_dcct(&mut self, pv: &PvName, value: f64) -> bool {
        if !(pv.discipline == Discipline::DI && pv.device == "DCCT") || pv.property != "CurrThold" {
            return false;
        }
        if value < 0.0 {
            warn!(stage = %self.config.prefix, value, "negative current threshold rejected");
            let previous = self.dcct_threshold;
            self.push(pv.to_string(), previous);
            return true;
        }
        self.dcct_threshold = value;
        true
    }

    fn set_rf(&mut self, pv: &PvName, value: f64) -> bool {
        let cavities = self.registry.cavity_indices().to_vec();
        if pv.discipline != Discipline::RF || cavities.is_empty() {
            return false;
        }
        let property = pv.property_with_suffix();
        let changed = match property.as_str() {
            "Volt-SP" => {
                let previous = self.lattice.rf_voltage();
                let share = value / cavities.len() as f64;
                for &idx in &cavities {
                    if let ElementKind::Cavity { voltage, .. } = &mut self.lattice.elements[idx].kind {
                        *voltage = share;
                    }
                }
                previous != value
            }
            "Freq-SP" => {
                let previous = self.lattice.rf_frequency();
                for &idx in &cavities {
                    if let ElementKind::Cavity { frequency, .. } = &mut self.lattice.elements[idx].kind {
                        *frequency = value;
                    }
                }
                previous != Some(value)
            }
            _ => return false,
        };
        if changed {
            self.dirty = true;
        }
        self.push_readback(pv, value);
        true
    }

    fn set_fake(&mut self, pv: &PvName, value: f64) -> bool {
        if pv.discipline != Discipline::FK {
            return false;
        }
        let family = family_of(pv);
        if !self.registry.is_fake_family(&family) {
            return false;
        }
        let property = pv.property_with_suffix();
        let mut changed = false;
        for &idx in self.registry.family_indices(&family) {
            let element = &mut self.lattice.elements[idx];
            let field = match property.as_str() {
                "ErrX-SP" => &mut element.dx,
                "ErrY-SP" => &mut element.dy,
                "ErrR-SP" => &mut element.roll,
                _ => return false,
            };
            changed |= *field != value;
            *field = value;
        }
        if changed {
            self.dirty = true;
        }
        true
    }

    fn set_timing(&mut self, pv: &PvName, value: f64) -> bool {
        if pv.discipline != Discipline::TI {
            return false;
        }
        let Some(magnet) = self.devices.pulsed_magnets.get_mut(&family_of(pv)) else {
            return false;
        };
        match pv.property_with_suffix().as_str() {
            "Enbl-SP" => {
                let enabled = value != 0.0;
                if magnet.enabled != enabled {
                    magnet.enabled = enabled;
                    self.injection_stale = true;
                    self.ejection_stale = true;
                }
                self.push_readback(pv, enabled);
                true
            }
            "Delay-SP" => {
                magnet.delay = value;
                self.push_readback(pv, value);
                true
            }
            _ => false,
        }
    }

    fn set_kind_extra(&mut self, pv: &PvName, value: f64) -> bool {
        (self.kind().hooks().extra_set)(self, pv, value)
    }
}

/// Lattice family named by the device field of a PV (`PU-InjKckr` → `InjKckr`).
fn family_of(pv: &PvName) -> String {
    match &pv.index {
        Some(index) => format!("{}-{}", pv.device, index),
        None => pv.device.clone(),
    }
}

/// Maps non-finite quantities to the undefined sentinel.
fn defined(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        UNDEF_VALUE
    }
}
