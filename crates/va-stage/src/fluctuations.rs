//! Gaussian fluctuations added to published PV values.

use std::collections::BTreeMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use va_core::{ErrorInfo, NoiseSource, PvValue, VaError};

/// Noise level for the PVs matching a glob pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluctuationRule {
    /// Glob over full PV names, e.g. `SI-*:DI-BPM:Pos?-Mon`.
    pub pattern: String,
    /// Standard deviation of the added noise, in the PV's unit.
    pub sigma: f64,
}

/// Compiled fluctuation rules with one deterministic noise stream per PV.
///
/// The first matching rule wins.
#[derive(Debug, Clone)]
pub struct FluctuationTable {
    rules: Vec<FluctuationRule>,
    globs: GlobSet,
    seed: u64,
    sources: BTreeMap<String, NoiseSource>,
}

fn pattern_error(pattern: &str, err: impl ToString) -> VaError {
    VaError::Config(
        ErrorInfo::new("fluctuation-pattern", err.to_string())
            .with_context("pattern", pattern)
            .with_hint("patterns use glob syntax: `*`, `?`, `[..]`, `{a,b}`"),
    )
}

impl FluctuationTable {
    /// Compiles `rules`; `seed` is the master seed of the noise streams.
    pub fn new(rules: Vec<FluctuationRule>, seed: u64) -> Result<Self, VaError> {
        let mut builder = GlobSetBuilder::new();
        for rule in &rules {
            if !(rule.sigma.is_finite() && rule.sigma >= 0.0) {
                return Err(pattern_error(&rule.pattern, "sigma must be finite and non-negative"));
            }
            builder.add(Glob::new(&rule.pattern).map_err(|err| pattern_error(&rule.pattern, err))?);
        }
        let globs = builder
            .build()
            .map_err(|err| pattern_error("<set>", err))?;
        Ok(Self {
            rules,
            globs,
            seed,
            sources: BTreeMap::new(),
        })
    }

    /// Table without rules.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            globs: GlobSet::empty(),
            seed: 0,
            sources: BTreeMap::new(),
        }
    }

    /// Returns `true` when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Sigma of the first rule matching `pv`.
    pub fn sigma_for(&self, pv: &str) -> Option<f64> {
        self.globs
            .matches(pv)
            .into_iter()
            .min()
            .map(|idx| self.rules[idx].sigma)
    }

    /// Adds noise to every sample of `value` when a rule matches `pv`.
    pub fn apply(&mut self, pv: &str, value: PvValue) -> PvValue {
        let Some(sigma) = self.sigma_for(pv).filter(|sigma| *sigma > 0.0) else {
            return value;
        };
        let seed = self.seed;
        let source = self
            .sources
            .entry(pv.to_string())
            .or_insert_with(|| NoiseSource::for_pv(seed, pv));
        match value {
            PvValue::Scalar(sample) => PvValue::Scalar(sample + source.gaussian(sigma)),
            PvValue::Array(samples) => PvValue::Array(
                samples
                    .into_iter()
                    .map(|sample| sample + source.gaussian(sigma))
                    .collect(),
            ),
        }
    }
}
