//! Machine and stage configuration.
//!
//! [`MachineConfig::default`] describes a complete demonstration machine
//! (linac, booster transport line, booster, storage-ring transport line and
//! storage ring). YAML files loaded with [`load_machine`] may override any
//! part of it; omitted fields take the defaults below.

use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use va_core::{io_error, ErrorInfo, VaError};
use va_optics::{
    CoordinateOffset, EfficiencyParameters, Element, LatticeLayout, LifetimeInputs, Twiss,
};

use crate::kinds::StageKind;

/// Whole machine: timing plus stages in pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Injection-cycle timing.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Stages, upstream first.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            stages: default_stages(),
        }
    }
}

impl MachineConfig {
    /// Stage with the given prefix.
    pub fn stage(&self, prefix: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|stage| stage.prefix == prefix)
    }

    /// Bucket count of the last ring in the pipeline, where injected bunches are stored.
    pub fn bunch_slots(&self) -> Option<usize> {
        self.stages
            .iter()
            .rev()
            .find(|stage| stage.kind.is_ring())
            .map(|stage| stage.lattice.harmonic_number)
    }

    /// Checks the pipeline shape: a linac first, unique prefixes, rings with a harmonic number.
    pub fn validate(&self) -> Result<(), VaError> {
        let first = self.stages.first().ok_or_else(|| {
            VaError::config("empty-machine", "machine has no stages")
                .with_context("stages", "0")
        })?;
        if first.kind != StageKind::Linac {
            return Err(VaError::Config(
                ErrorInfo::new("pipeline-head", "the first stage must be a linac")
                    .with_context("prefix", first.prefix.clone()),
            ));
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.prefix.is_empty() || stage.prefix.contains([':', '-']) {
                return Err(VaError::Config(
                    ErrorInfo::new("stage-prefix", "stage prefix must be a plain section name")
                        .with_context("prefix", stage.prefix.clone()),
                ));
            }
            if self.stages[..idx].iter().any(|other| other.prefix == stage.prefix) {
                return Err(VaError::Config(
                    ErrorInfo::new("duplicate-stage", "stage prefixes must be unique")
                        .with_context("prefix", stage.prefix.clone()),
                ));
            }
            if stage.kind.is_ring() && stage.lattice.harmonic_number == 0 {
                return Err(VaError::Config(
                    ErrorInfo::new("harmonic-number", "rings need a harmonic number")
                        .with_context("prefix", stage.prefix.clone()),
                ));
            }
        }
        if !(self.timing.linac_frequency.is_finite() && self.timing.linac_frequency > 0.0) {
            return Err(VaError::Config(
                ErrorInfo::new("linac-frequency", "linac frequency must be positive")
                    .with_context("frequency", self.timing.linac_frequency.to_string()),
            ));
        }
        if let Some(slots) = self.bunch_slots() {
            if self.timing.injection_bunch >= slots {
                return Err(VaError::Config(
                    ErrorInfo::new("injection-bunch", "injection bunch outside the ring")
                        .with_context("injection_bunch", self.timing.injection_bunch.to_string())
                        .with_context("bunch_slots", slots.to_string()),
                ));
            }
        }
        Ok(())
    }
}

/// Injection-cycle timing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Linac RF frequency [Hz]; bunches are six RF periods apart.
    #[serde(default = "default_linac_frequency")]
    pub linac_frequency: f64,
    /// Storage-ring bucket targeted by the next cycle.
    #[serde(default)]
    pub injection_bunch: usize,
    /// Buckets the injection bunch advances after each cycle.
    #[serde(default)]
    pub increment: usize,
}

fn default_linac_frequency() -> f64 {
    3.0e9
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            linac_frequency: default_linac_frequency(),
            injection_bunch: 0,
            increment: 0,
        }
    }
}

/// One accelerator stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Section prefix (`LI`, `TB`, `BO`, `TS`, `SI`).
    pub prefix: String,
    /// Stage behaviour.
    pub kind: StageKind,
    /// Lattice recipe.
    pub lattice: LatticeLayout,
    /// Bunch slots of the charge ledger; rings default to the harmonic number, lines to one.
    #[serde(default)]
    pub nr_bunches: Option<usize>,
    /// Family the lattice is rotated to start at (rings).
    #[serde(default)]
    pub injection_point: Option<String>,
    /// DC power supplies.
    #[serde(default)]
    pub power_supplies: Vec<PowerSupplyConfig>,
    /// Pulsed kickers and septa.
    #[serde(default)]
    pub pulsed_magnets: Vec<PulsedMagnetConfig>,
    /// Beam produced by the stage itself (linac electron gun).
    #[serde(default)]
    pub source: Option<BeamConfig>,
    /// Frame change applied to the beam received from upstream.
    #[serde(default)]
    pub coordinate_offset: CoordinateOffset,
    /// Extraction towards the next stage (booster).
    #[serde(default)]
    pub ejection: Option<EjectionConfig>,
    /// Residual gas used by the lifetime model.
    #[serde(default)]
    pub gas: LifetimeInputs,
    /// Touschek lifetime at 1 mA bunch current [s]; infinite disables Touschek losses.
    #[serde(default = "default_touschek_reference")]
    pub touschek_reference_lifetime: f64,
    /// Electron gun (linac).
    #[serde(default)]
    pub egun: Option<EGunConfig>,
    /// Energy ramp (booster).
    #[serde(default)]
    pub ramp: Option<RampConfig>,
}

fn default_touschek_reference() -> f64 {
    f64::INFINITY
}

impl StageConfig {
    /// Creates a stage with no devices.
    pub fn new(prefix: impl Into<String>, kind: StageKind, lattice: LatticeLayout) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
            lattice,
            nr_bunches: None,
            injection_point: None,
            power_supplies: Vec::new(),
            pulsed_magnets: Vec::new(),
            source: None,
            coordinate_offset: CoordinateOffset::default(),
            ejection: None,
            gas: LifetimeInputs::default(),
            touschek_reference_lifetime: default_touschek_reference(),
            egun: None,
            ramp: None,
        }
    }

    /// Number of ledger slots.
    pub fn bunch_count(&self) -> usize {
        match self.nr_bunches {
            Some(count) => count,
            None if self.kind.is_ring() => self.lattice.harmonic_number.max(1),
            None => 1,
        }
    }
}

/// Quantity a power supply drives on its magnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagnetField {
    /// Quadrupole gradient `k`.
    Gradient,
    /// Dipole bending angle.
    Bend,
    /// Horizontal corrector kick.
    HorizontalKick,
    /// Vertical corrector kick.
    VerticalKick,
}

/// DC power supply feeding one magnet family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSupplyConfig {
    /// Magnet family.
    pub family: String,
    /// Driven quantity.
    pub field: MagnetField,
    /// Linear conversion `strength = factor · current`.
    pub factor: f64,
    /// Lowest accepted current [A].
    pub low: f64,
    /// Highest accepted current [A].
    pub high: f64,
    /// Initial current [A]; read back from the lattice when absent.
    #[serde(default)]
    pub current: Option<f64>,
}

impl PowerSupplyConfig {
    /// Power supply with the given conversion and band.
    pub fn new(family: impl Into<String>, field: MagnetField, factor: f64, low: f64, high: f64) -> Self {
        Self {
            family: family.into(),
            field,
            factor,
            low,
            high,
            current: None,
        }
    }
}

/// Job of a pulsed magnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulsedRole {
    /// Injection kicker (on-axis kicker in the storage ring).
    InjectionKicker,
    /// Non-linear injection kicker.
    NonLinearKicker,
    /// Extraction kicker.
    EjectionKicker,
    /// Injection or extraction septum.
    Septum,
}

/// Pulsed magnet and its timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsedMagnetConfig {
    /// Lattice family of the magnet.
    pub family: String,
    /// Role in injection or extraction.
    pub role: PulsedRole,
    /// Kick angle while pulsing [rad].
    #[serde(default)]
    pub kick: f64,
    /// Whether the timing system triggers the magnet.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Trigger delay [s].
    #[serde(default)]
    pub delay: f64,
    /// Rise time of the pulse [s].
    #[serde(default)]
    pub rise_time: f64,
    /// Flat-top duration [s].
    #[serde(default = "default_flat_top")]
    pub flat_top: f64,
    /// Flight time from the electron gun to the magnet [s].
    #[serde(default)]
    pub flight_time: f64,
}

fn enabled() -> bool {
    true
}

fn default_flat_top() -> f64 {
    2.0e-6
}

impl PulsedMagnetConfig {
    /// Enabled magnet with zero kick and default timing.
    pub fn new(family: impl Into<String>, role: PulsedRole) -> Self {
        Self {
            family: family.into(),
            role,
            kick: 0.0,
            enabled: true,
            delay: 0.0,
            rise_time: 0.0,
            flat_top: default_flat_top(),
            flight_time: 0.0,
        }
    }
}

/// Beam description of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamConfig {
    /// Total emittance [m·rad].
    pub emittance: f64,
    /// Relative energy spread.
    pub energy_spread: f64,
    /// Global coupling.
    pub global_coupling: f64,
    /// Twiss at the start of the stage.
    pub twiss: Twiss,
}

impl BeamConfig {
    /// Efficiency bundle of this beam.
    pub fn parameters(&self) -> EfficiencyParameters {
        EfficiencyParameters::new(
            self.emittance,
            self.energy_spread,
            self.global_coupling,
            self.twiss,
        )
    }
}

/// Extraction towards the next stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EjectionConfig {
    /// Family marking the extraction point; the ejection line ends there.
    pub extraction_point: String,
    /// Beam energy at extraction [eV].
    pub energy: f64,
}

/// Electron gun of the linac.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EGunConfig {
    /// Whether the gun fires.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Trigger delay [s].
    #[serde(default)]
    pub delay: f64,
    /// Single-bunch mode.
    #[serde(default)]
    pub single_bunch: bool,
    /// Charge of the single bunch [C].
    #[serde(default = "default_single_bunch_charge")]
    pub single_bunch_charge: f64,
    /// Charge of the whole multi-bunch train [C].
    #[serde(default = "default_multi_bunch_charge")]
    pub multi_bunch_charge: f64,
    /// Bunches in the multi-bunch train.
    #[serde(default = "default_multi_bunch_count")]
    pub multi_bunch_count: usize,
}

fn default_single_bunch_charge() -> f64 {
    1.0e-9
}

fn default_multi_bunch_charge() -> f64 {
    3.0e-9
}

fn default_multi_bunch_count() -> usize {
    75
}

impl Default for EGunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: 0.0,
            single_bunch: false,
            single_bunch_charge: default_single_bunch_charge(),
            multi_bunch_charge: default_multi_bunch_charge(),
            multi_bunch_count: default_multi_bunch_count(),
        }
    }
}

impl EGunConfig {
    /// Charge vector produced by one shot.
    pub fn bunch_train(&self) -> Vec<f64> {
        if self.single_bunch {
            vec![self.single_bunch_charge]
        } else {
            let count = self.multi_bunch_count.max(1);
            vec![self.multi_bunch_charge / count as f64; count]
        }
    }
}

/// Booster energy ramp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampConfig {
    /// Whether the ramp power supplies are triggered.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Trigger delay [s].
    #[serde(default)]
    pub delay: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: 0.0,
        }
    }
}

/// Reads a machine description from YAML.
pub fn load_machine(path: &Path) -> Result<MachineConfig, VaError> {
    let bytes = fs::read(path).map_err(|err| {
        io_error("machine-read", err).with_context("path", path.display().to_string())
    })?;
    let config: MachineConfig = serde_yaml::from_slice(&bytes).map_err(|err| {
        io_error("yaml_deserialize", err).with_context("path", path.display().to_string())
    })?;
    config.validate()?;
    Ok(config)
}

/// Writes a machine description as YAML.
pub fn save_machine(path: &Path, config: &MachineConfig) -> Result<(), VaError> {
    let text = serde_yaml::to_string(config).map_err(|err| io_error("yaml_serialize", err))?;
    fs::write(path, text).map_err(|err| {
        io_error("machine-write", err).with_context("path", path.display().to_string())
    })
}

const LINE_ENERGY: f64 = 150.0e6;
const RING_ENERGY: f64 = 3.0e9;
const RF_FREQUENCY: f64 = 499.654e6;
const BOOSTER_CELLS: usize = 113;
const STORAGE_RING_CELLS: usize = 118;

fn default_stages() -> Vec<StageConfig> {
    vec![
        linac(),
        transport_line("TB", LINE_ENERGY),
        booster(),
        transport_line("TS", RING_ENERGY),
        storage_ring(),
    ]
}

fn standard_power_supplies() -> Vec<PowerSupplyConfig> {
    vec![
        PowerSupplyConfig::new("QF", MagnetField::Gradient, 0.01, 0.0, 300.0),
        PowerSupplyConfig::new("QD", MagnetField::Gradient, -0.01, 0.0, 300.0),
        PowerSupplyConfig::new("CH", MagnetField::HorizontalKick, 1.0e-5, -10.0, 10.0),
        PowerSupplyConfig::new("CV", MagnetField::VerticalKick, 1.0e-5, -10.0, 10.0),
    ]
}

fn doublet(drift: &str) -> Vec<Element> {
    vec![
        Element::marker("start"),
        Element::drift(drift, 1.0),
        Element::quadrupole("QF", 0.2, 1.5),
        Element::drift(drift, 0.5),
        Element::quadrupole("QD", 0.2, -1.5),
        Element::drift(drift, 1.0),
        Element::bpm("BPM"),
        Element::corrector("CH"),
        Element::corrector("CV"),
        Element::drift(drift, 0.5),
    ]
}

fn fodo_cell(cells: usize) -> Vec<Element> {
    let angle = 2.0 * PI / (2 * cells) as f64;
    vec![
        Element::quadrupole("QF", 0.2, 2.0),
        Element::drift("D", 0.5),
        Element::dipole("B", 1.0, angle),
        Element::drift("D", 0.5),
        Element::bpm("BPM"),
        Element::corrector("CH"),
        Element::corrector("CV"),
        Element::quadrupole("QD", 0.2, -2.0),
        Element::drift("D", 0.5),
        Element::dipole("B", 1.0, angle),
        Element::drift("D", 0.5),
    ]
}

fn linac() -> StageConfig {
    let mut head = doublet("LD");
    head.push(Element::marker("end"));
    let layout = LatticeLayout {
        energy: LINE_ENERGY,
        harmonic_number: 0,
        head,
        cell: Vec::new(),
        cells: 0,
        tail: Vec::new(),
    };
    let mut stage = StageConfig::new("LI", StageKind::Linac, layout);
    stage.power_supplies = standard_power_supplies();
    stage.source = Some(BeamConfig {
        emittance: 100.0e-9,
        energy_spread: 1.0e-3,
        global_coupling: 1.0,
        twiss: Twiss::with_betas(5.0, 5.0),
    });
    stage.egun = Some(EGunConfig::default());
    stage
}

fn transport_line(prefix: &str, energy: f64) -> StageConfig {
    let mut head = doublet("D");
    head.push(Element::kicker("InjSept", 0.5));
    head.push(Element::marker("end"));
    let layout = LatticeLayout {
        energy,
        harmonic_number: 0,
        head,
        cell: Vec::new(),
        cells: 0,
        tail: Vec::new(),
    };
    let mut stage = StageConfig::new(prefix, StageKind::TransportLine, layout);
    stage.power_supplies = standard_power_supplies();
    stage.pulsed_magnets = vec![PulsedMagnetConfig::new("InjSept", PulsedRole::Septum)];
    stage
}

fn booster() -> StageConfig {
    let layout = LatticeLayout {
        energy: LINE_ENERGY,
        harmonic_number: 828,
        head: vec![
            Element::marker("InjSept"),
            Element::kicker("InjKckr", 0.5),
            Element::cavity("BRFCav", 1.0e6, RF_FREQUENCY),
        ],
        cell: fodo_cell(BOOSTER_CELLS),
        cells: BOOSTER_CELLS,
        tail: vec![
            Element::kicker("EjeKckr", 0.5),
            Element::drift("D", 0.5),
            Element::marker("EjeSept"),
        ],
    };
    let mut stage = StageConfig::new("BO", StageKind::Booster, layout);
    stage.injection_point = Some("InjSept".to_string());
    stage.power_supplies = standard_power_supplies();
    stage.pulsed_magnets = vec![
        PulsedMagnetConfig::new("InjKckr", PulsedRole::InjectionKicker),
        PulsedMagnetConfig::new("EjeKckr", PulsedRole::EjectionKicker),
    ];
    stage.ejection = Some(EjectionConfig {
        extraction_point: "EjeSept".to_string(),
        energy: RING_ENERGY,
    });
    stage.ramp = Some(RampConfig::default());
    stage
}

fn storage_ring() -> StageConfig {
    let layout = LatticeLayout {
        energy: RING_ENERGY,
        harmonic_number: 864,
        head: vec![
            Element::marker("InjSept"),
            Element::kicker("InjDpKckr", 0.5),
            Element::kicker("InjNLKckr", 0.5),
            Element::cavity("SRFCav", 3.0e6, RF_FREQUENCY),
        ],
        cell: fodo_cell(STORAGE_RING_CELLS),
        cells: STORAGE_RING_CELLS,
        tail: Vec::new(),
    };
    let mut stage = StageConfig::new("SI", StageKind::StorageRing, layout);
    stage.injection_point = Some("InjSept".to_string());
    stage.power_supplies = standard_power_supplies();
    let mut nlk = PulsedMagnetConfig::new("InjNLKckr", PulsedRole::NonLinearKicker);
    nlk.enabled = false;
    stage.pulsed_magnets = vec![
        PulsedMagnetConfig::new("InjDpKckr", PulsedRole::InjectionKicker),
        nlk,
    ];
    stage.touschek_reference_lifetime = 10.0 * va_core::units::HOUR;
    stage
}
