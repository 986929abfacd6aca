//! Power supplies, pulsed magnets and bunch timing.

use std::ops::Deref;

use tracing::warn;
use va_optics::{ElementKind, Lattice};

use crate::config::{MagnetField, PowerSupplyConfig, PulsedMagnetConfig, PulsedRole};

/// Slack allowed on pulse-window edges [s].
const TIMING_TOLERANCE: f64 = 1.0e-12;

/// DC power supply driving one magnet family.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSupply {
    family: String,
    field: MagnetField,
    factor: f64,
    low: f64,
    high: f64,
    current: f64,
    indices: Vec<usize>,
}

/// Result of a current setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentChange {
    /// Current actually applied [A].
    pub applied: f64,
    /// `true` when the request fell outside `[low, high]`.
    pub clamped: bool,
    /// `true` when the applied current differs from the previous one.
    pub changed: bool,
}

impl PowerSupply {
    /// Binds `config` to the elements at `indices`.
    ///
    /// A configured initial current is written to the lattice; otherwise the
    /// current is read back from the first element.
    pub fn new(config: &PowerSupplyConfig, indices: Vec<usize>, lattice: &mut Lattice) -> Self {
        let mut supply = Self {
            family: config.family.clone(),
            field: config.field,
            factor: config.factor,
            low: config.low.min(config.high),
            high: config.high.max(config.low),
            current: 0.0,
            indices,
        };
        match config.current {
            Some(current) => {
                supply.current = supply.clamp(current);
                supply.apply(lattice);
            }
            None => {
                let strength = supply
                    .indices
                    .first()
                    .and_then(|&idx| lattice.elements.get(idx))
                    .and_then(|element| field_strength(supply.field, &element.kind))
                    .unwrap_or(0.0);
                supply.current = strength / supply.factor;
            }
        }
        supply
    }

    /// Magnet family.
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Present current [A].
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Accepted band `[low, high]`.
    pub fn band(&self) -> (f64, f64) {
        (self.low, self.high)
    }

    /// Clamps a request into the accepted band.
    pub fn clamp(&self, requested: f64) -> f64 {
        requested.clamp(self.low, self.high)
    }

    /// Applies a setpoint, clamping it into the band with a warning.
    pub fn set_current(&mut self, requested: f64, lattice: &mut Lattice) -> CurrentChange {
        let applied = self.clamp(requested);
        let clamped = applied != requested;
        if clamped {
            warn!(
                family = %self.family,
                requested,
                applied,
                low = self.low,
                high = self.high,
                "current setpoint clamped"
            );
        }
        let changed = applied != self.current;
        if changed {
            self.current = applied;
            self.apply(lattice);
        }
        CurrentChange {
            applied,
            clamped,
            changed,
        }
    }

    /// Writes `factor · current` into every driven element.
    pub fn apply(&self, lattice: &mut Lattice) {
        let strength = self.factor * self.current;
        for &idx in &self.indices {
            if let Some(element) = lattice.elements.get_mut(idx) {
                set_field_strength(self.field, &mut element.kind, strength);
            }
        }
    }
}

fn field_strength(field: MagnetField, kind: &ElementKind) -> Option<f64> {
    match (field, kind) {
        (MagnetField::Gradient, ElementKind::Quadrupole { k }) => Some(*k),
        (MagnetField::Bend, ElementKind::Dipole { angle }) => Some(*angle),
        (MagnetField::HorizontalKick, ElementKind::Corrector { hkick, .. }) => Some(*hkick),
        (MagnetField::VerticalKick, ElementKind::Corrector { vkick, .. }) => Some(*vkick),
        _ => None,
    }
}

fn set_field_strength(field: MagnetField, kind: &mut ElementKind, strength: f64) {
    match (field, kind) {
        (MagnetField::Gradient, ElementKind::Quadrupole { k }) => *k = strength,
        (MagnetField::Bend, ElementKind::Dipole { angle }) => *angle = strength,
        (MagnetField::HorizontalKick, ElementKind::Corrector { hkick, .. }) => *hkick = strength,
        (MagnetField::VerticalKick, ElementKind::Corrector { vkick, .. }) => *vkick = strength,
        _ => {}
    }
}

/// Returns `true` when `field` can drive an element of this kind.
pub fn drives(field: MagnetField, kind: &ElementKind) -> bool {
    field_strength(field, kind).is_some()
}

/// Pulsed kicker or septum with its trigger timing.
#[derive(Debug, Clone, PartialEq)]
pub struct PulsedMagnet {
    /// Lattice family.
    pub family: String,
    /// Role in injection or extraction.
    pub role: PulsedRole,
    /// Kick while pulsing [rad].
    pub kick: f64,
    /// Whether the magnet is triggered.
    pub enabled: bool,
    /// Trigger delay [s].
    pub delay: f64,
    /// Rise time [s].
    pub rise_time: f64,
    /// Flat-top duration [s].
    pub flat_top: f64,
    /// Flight time from the electron gun [s].
    pub flight_time: f64,
    indices: Vec<usize>,
}

impl PulsedMagnet {
    /// Binds `config` to the elements at `indices`.
    pub fn new(config: &PulsedMagnetConfig, indices: Vec<usize>) -> Self {
        Self {
            family: config.family.clone(),
            role: config.role,
            kick: config.kick,
            enabled: config.enabled,
            delay: config.delay,
            rise_time: config.rise_time,
            flat_top: config.flat_top,
            flight_time: config.flight_time,
            indices,
        }
    }

    /// Lattice indices of the magnet.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// First lattice index, used to order magnets along the beam.
    pub fn position(&self) -> usize {
        self.indices.first().copied().unwrap_or(usize::MAX)
    }

    /// Flat-top window `[delay + rise, delay + rise + flat_top]`.
    pub fn window(&self) -> (f64, f64) {
        let start = self.delay + self.rise_time;
        (start, start + self.flat_top)
    }

    /// Returns `true` when a bunch arriving at `arrival` sees the flat top.
    pub fn accepts(&self, arrival: f64) -> bool {
        let (start, end) = self.window();
        self.enabled && arrival >= start - TIMING_TOLERANCE && arrival <= end + TIMING_TOLERANCE
    }

    /// Charge that survives the magnet; bunches outside the flat top are lost.
    pub fn timing_pass(&self, charge: &[f64], charge_time: &[f64], master_delay: f64) -> Vec<f64> {
        charge
            .iter()
            .zip(charge_time)
            .map(|(&q, &t)| {
                if self.accepts(t + self.flight_time - master_delay) {
                    q
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Time origin of the ring buckets seen through this injection kicker.
    pub fn slot_origin(&self) -> f64 {
        self.delay - self.flight_time + self.rise_time
    }
}

/// Moves charge into ring buckets by arrival time.
///
/// Bucket `round((t − origin) / bunch_separation) mod harmonic_number`;
/// charges landing in the same bucket add up.
pub fn reslot(
    charge: &[f64],
    charge_time: &[f64],
    origin: f64,
    bunch_separation: f64,
    harmonic_number: usize,
) -> (Vec<f64>, Vec<f64>) {
    let slots = harmonic_number.max(1);
    let mut new_charge = vec![0.0; slots];
    let mut new_time = vec![0.0; slots];
    for (&q, &t) in charge.iter().zip(charge_time) {
        let bucket = ((t - origin) / bunch_separation).round() as i64;
        let idx = bucket.rem_euclid(slots as i64) as usize;
        new_charge[idx] += q;
        new_time[idx] = t;
    }
    (new_charge, new_time)
}

/// Engages pulsed kicks on a lattice and restores zero kick when dropped.
pub struct KickerGuard<'a> {
    lattice: &'a mut Lattice,
    engaged: Vec<usize>,
}

impl<'a> KickerGuard<'a> {
    /// Sets the kick of every enabled magnet in `magnets`.
    pub fn engage<'m>(
        lattice: &'a mut Lattice,
        magnets: impl IntoIterator<Item = &'m PulsedMagnet>,
    ) -> Self {
        let mut engaged = Vec::new();
        for magnet in magnets.into_iter().filter(|magnet| magnet.enabled) {
            for &idx in magnet.indices() {
                if let Some(element) = lattice.elements.get_mut(idx) {
                    if let ElementKind::Kicker { angle } = &mut element.kind {
                        *angle = magnet.kick;
                        engaged.push(idx);
                    }
                }
            }
        }
        Self { lattice, engaged }
    }

    /// Number of engaged elements.
    pub fn engaged(&self) -> usize {
        self.engaged.len()
    }
}

impl Deref for KickerGuard<'_> {
    type Target = Lattice;

    fn deref(&self) -> &Lattice {
        &*self.lattice
    }
}

impl Drop for KickerGuard<'_> {
    fn drop(&mut self) {
        for &idx in &self.engaged {
            if let Some(element) = self.lattice.elements.get_mut(idx) {
                if let ElementKind::Kicker { angle } = &mut element.kind {
                    *angle = 0.0;
                }
            }
        }
    }
}
