//! Device registry: the PV table of one stage and the lattice elements behind it.
//!
//! The registry is built once from the stage configuration and its lattice.
//! Devices whose family is missing from the lattice, or that cannot drive the
//! elements they name, are skipped with a warning.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;
use va_core::{PvAccess, PvName};
use va_optics::{ElementKind, Lattice};

use crate::config::StageConfig;
use crate::devices::{drives, PowerSupply, PulsedMagnet};

/// How the value of a PV is kept up to date in the PV database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Refresh {
    /// Recomputed and pushed on every tick (currents, lifetimes).
    Dynamic,
    /// Pushed after each change of the stage state (orbit, tunes).
    OnStateChange,
    /// Setpoint or readback mirror; updated by explicit pushes after writes.
    Setpoint,
    /// Fixed at start-up.
    Constant,
}

/// One PV of the stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvEntry {
    /// Full PV name.
    pub name: String,
    /// Client access mode.
    pub access: PvAccess,
    /// Refresh policy.
    pub refresh: Refresh,
}

impl PvEntry {
    /// Entry whose access is derived from the name's suffix.
    pub fn new(name: impl Into<String>, refresh: Refresh) -> Self {
        let name = name.into();
        let access = PvName::parse(&name).map_or(PvAccess::ReadOnly, |parsed| parsed.access());
        Self {
            name,
            access,
            refresh,
        }
    }
}

/// Power supplies and pulsed magnets bound to lattice elements.
#[derive(Debug, Clone, Default)]
pub struct Devices {
    /// Power supplies keyed by device name (`SI-Fam:PS-QF`).
    pub power_supplies: BTreeMap<String, PowerSupply>,
    /// Pulsed magnets keyed by family.
    pub pulsed_magnets: BTreeMap<String, PulsedMagnet>,
}

/// `{prefix}-Fam:PS-{family}`
pub fn power_supply_device(prefix: &str, family: &str) -> String {
    format!("{prefix}-Fam:PS-{family}")
}

/// `{prefix}-Fam:PU-{family}`
pub fn pulsed_device(prefix: &str, family: &str) -> String {
    format!("{prefix}-Fam:PU-{family}")
}

/// `{prefix}-Fam:TI-{family}`
pub fn timing_device(prefix: &str, family: &str) -> String {
    format!("{prefix}-Fam:TI-{family}")
}

/// `{prefix}-Fam:FK-{family}`
pub fn fake_device(prefix: &str, family: &str) -> String {
    format!("{prefix}-Fam:FK-{family}")
}

/// `{prefix}-{number:02}:DI-BPM`
pub fn bpm_device(prefix: &str, number: usize) -> String {
    format!("{prefix}-{number:02}:DI-BPM")
}

/// Global device `{prefix}-Glob:{device}`.
pub fn global_device(prefix: &str, device: &str) -> String {
    format!("{prefix}-Glob:{device}")
}

/// PVs and element lookups of one stage.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    prefix: String,
    entries: BTreeMap<String, PvEntry>,
    families: BTreeMap<String, Vec<usize>>,
    bpms: BTreeMap<String, usize>,
    bpm_positions: Vec<f64>,
    cavities: Vec<usize>,
    fake_families: BTreeSet<String>,
}

impl DeviceRegistry {
    /// Builds the registry and binds the configured devices to `lattice`.
    ///
    /// `origin` is the index the lattice's original first element ended up at
    /// after rotation; BPM positions are measured from it.
    pub fn build(config: &StageConfig, lattice: &mut Lattice, origin: usize) -> (Self, Devices) {
        let prefix = config.prefix.as_str();
        let mut families: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, element) in lattice.elements.iter().enumerate() {
            families.entry(element.family.clone()).or_default().push(idx);
        }

        let mut registry = Self {
            prefix: prefix.to_string(),
            entries: BTreeMap::new(),
            families,
            bpms: BTreeMap::new(),
            bpm_positions: Vec::new(),
            cavities: Vec::new(),
            fake_families: BTreeSet::new(),
        };
        let devices = Devices {
            power_supplies: registry.bind_power_supplies(config, lattice),
            pulsed_magnets: registry.bind_pulsed_magnets(config),
        };
        registry.register_diagnostics(config, lattice, origin);
        registry.register_lattice_devices(lattice);
        for entry in (config.kind.hooks().extra_pvs)(prefix) {
            registry.insert(entry);
        }
        (registry, devices)
    }

    fn insert(&mut self, entry: PvEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    fn add(&mut self, device: &str, property: &str, refresh: Refresh) {
        self.insert(PvEntry::new(format!("{device}:{property}"), refresh));
    }

    fn bind_power_supplies(
        &mut self,
        config: &StageConfig,
        lattice: &mut Lattice,
    ) -> BTreeMap<String, PowerSupply> {
        let mut supplies = BTreeMap::new();
        for ps in &config.power_supplies {
            let device = power_supply_device(&config.prefix, &ps.family);
            let indices: Vec<usize> = self
                .family_indices(&ps.family)
                .iter()
                .copied()
                .filter(|&idx| drives(ps.field, &lattice.elements[idx].kind))
                .collect();
            if indices.is_empty() {
                warn!(stage = %config.prefix, device = %device, "no magnet of the family can be driven, power supply skipped");
                continue;
            }
            if !(ps.factor.is_finite() && ps.factor != 0.0) {
                warn!(stage = %config.prefix, device = %device, factor = ps.factor, "invalid conversion factor, power supply skipped");
                continue;
            }
            self.add(&device, "Current-SP", Refresh::Setpoint);
            self.add(&device, "Current-RB", Refresh::Setpoint);
            supplies.insert(device, PowerSupply::new(ps, indices, lattice));
        }
        supplies
    }

    fn bind_pulsed_magnets(&mut self, config: &StageConfig) -> BTreeMap<String, PulsedMagnet> {
        let mut magnets = BTreeMap::new();
        for pm in &config.pulsed_magnets {
            let indices = self.family_indices(&pm.family).to_vec();
            if indices.is_empty() {
                warn!(stage = %config.prefix, family = %pm.family, "pulsed magnet family not in lattice, skipped");
                continue;
            }
            let pulsed = pulsed_device(&config.prefix, &pm.family);
            self.add(&pulsed, "Kick-SP", Refresh::Setpoint);
            self.add(&pulsed, "Kick-RB", Refresh::Setpoint);
            let timing = timing_device(&config.prefix, &pm.family);
            for property in ["Enbl-SP", "Enbl-RB", "Delay-SP", "Delay-RB"] {
                self.add(&timing, property, Refresh::Setpoint);
            }
            magnets.insert(pm.family.clone(), PulsedMagnet::new(pm, indices));
        }
        magnets
    }

    fn register_diagnostics(&mut self, config: &StageConfig, lattice: &Lattice, origin: usize) {
        let prefix = config.prefix.as_str();
        let len = lattice.len().max(1);
        let spos = lattice.spos();
        let length = lattice.length();
        let origin_spos = spos.get(origin).copied().unwrap_or(0.0);

        let mut bpm_indices = self.family_indices("BPM").to_vec();
        bpm_indices.retain(|&idx| matches!(lattice.elements[idx].kind, ElementKind::Bpm));
        bpm_indices.sort_by_key(|&idx| (idx + len - origin % len) % len);
        for (number, &idx) in bpm_indices.iter().enumerate() {
            let device = bpm_device(prefix, number + 1);
            self.add(&device, "PosX-Mon", Refresh::OnStateChange);
            self.add(&device, "PosY-Mon", Refresh::OnStateChange);
            self.bpms.insert(device, idx);
            let position = if length > 0.0 {
                (spos[idx] - origin_spos).rem_euclid(length)
            } else {
                spos[idx]
            };
            self.bpm_positions.push(position);
        }
        if !bpm_indices.is_empty() {
            self.add(&global_device(prefix, "MO-Lattice"), "BPMPos-Cte", Refresh::Constant);
        }

        if config.kind.is_ring() {
            let dcct = global_device(prefix, "DI-DCCT");
            self.add(&dcct, "Current-Mon", Refresh::Dynamic);
            self.add(&dcct, "BbBCurrent-Mon", Refresh::Dynamic);
            self.add(&dcct, "CurrThold", Refresh::Setpoint);
            self.add(&dcct, "HwFlt-Mon", Refresh::OnStateChange);
            let info = global_device(prefix, "AP-CurrInfo");
            self.add(&info, "CurrLT-Mon", Refresh::Dynamic);
            self.add(&info, "BbBCurrLT-Mon", Refresh::Dynamic);
            let tune = global_device(prefix, "DI-Tune");
            for property in ["Freq1-Mon", "Freq2-Mon", "Freq3-Mon"] {
                self.add(&tune, property, Refresh::OnStateChange);
            }
            let beam = global_device(prefix, "VA-Beam");
            self.add(&beam, "BeamCurrentAdd-SP", Refresh::Setpoint);
            self.add(&beam, "BeamCurrentDump-Cmd", Refresh::Setpoint);
        }
    }

    fn register_lattice_devices(&mut self, lattice: &Lattice) {
        let prefix = self.prefix.clone();
        self.cavities = lattice
            .elements
            .iter()
            .enumerate()
            .filter(|(_, element)| matches!(element.kind, ElementKind::Cavity { .. }))
            .map(|(idx, _)| idx)
            .collect();
        if !self.cavities.is_empty() {
            let cavity = global_device(&prefix, "RF-Cav");
            for property in ["Volt-SP", "Volt-RB", "Freq-SP", "Freq-RB"] {
                self.add(&cavity, property, Refresh::Setpoint);
            }
        }

        let fake: BTreeSet<String> = lattice
            .elements
            .iter()
            .filter(|element| {
                matches!(
                    element.kind,
                    ElementKind::Quadrupole { .. } | ElementKind::Dipole { .. }
                )
            })
            .map(|element| element.family.clone())
            .collect();
        for family in &fake {
            let device = fake_device(&prefix, family);
            for property in ["ErrX-SP", "ErrY-SP", "ErrR-SP"] {
                self.add(&device, property, Refresh::Setpoint);
            }
        }
        self.fake_families = fake;
    }

    /// Section prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// All PV entries, sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = &PvEntry> {
        self.entries.values()
    }

    /// Entry of `name`.
    pub fn entry(&self, name: &str) -> Option<&PvEntry> {
        self.entries.get(name)
    }

    /// Number of PVs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the stage exposes no PV.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the PVs with the given refresh policy.
    pub fn names_with(&self, refresh: Refresh) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.refresh == refresh)
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Lattice indices of `family`; empty when the family is unknown.
    pub fn family_indices(&self, family: &str) -> &[usize] {
        self.families.get(family).map_or(&[], Vec::as_slice)
    }

    /// Lattice index of a BPM device.
    pub fn bpm_index(&self, device: &str) -> Option<usize> {
        self.bpms.get(device).copied()
    }

    /// BPM positions from the lattice origin, in BPM number order [m].
    pub fn bpm_positions(&self) -> &[f64] {
        &self.bpm_positions
    }

    /// Lattice indices of the RF cavities.
    pub fn cavity_indices(&self) -> &[usize] {
        &self.cavities
    }

    /// Returns `true` for families that accept misalignment errors.
    pub fn is_fake_family(&self, family: &str) -> bool {
        self.fake_families.contains(family)
    }
}
