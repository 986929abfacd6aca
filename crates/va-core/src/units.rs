//! Physical constants and unit conversions (SI unless noted).

/// Speed of light in vacuum [m/s].
pub const LIGHT_SPEED: f64 = 299_792_458.0;
/// Electron rest energy [eV].
pub const ELECTRON_REST_ENERGY_EV: f64 = 0.510_998_95e6;
/// Classical electron radius [m].
pub const CLASSICAL_ELECTRON_RADIUS: f64 = 2.817_940_326_2e-15;
/// Boltzmann constant [J/K].
pub const BOLTZMANN: f64 = 1.380_649e-23;
/// Fine structure constant.
pub const FINE_STRUCTURE: f64 = 7.297_352_569_3e-3;
/// Quantum constant of the equilibrium emittance for electrons [m].
pub const CQ: f64 = 3.8319e-13;
/// Sands radiation constant for electrons [m/GeV^3].
pub const CGAMMA: f64 = 8.846e-5;

/// One milliampere [A].
pub const MILLI_AMPERE: f64 = 1e-3;
/// One nanocoulomb [C].
pub const NANO_COULOMB: f64 = 1e-9;
/// One hour [s].
pub const HOUR: f64 = 3600.0;
/// Metres to nanometres, used for BPM readings.
pub const METER_TO_NANOMETER: f64 = 1e9;

/// Bunch current at which a Touschek reference lifetime is quoted [A].
pub const TOUSCHEK_REFERENCE_CURRENT: f64 = 1e-3;
