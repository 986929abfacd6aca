//! PV database: the single writer of published values.
//!
//! Areas push computed values through [`PvDatabase::apply_update`]; clients
//! write through [`PvDatabase::client_write`], which checks the access mode
//! and returns the index of the owning area. Readers hold a [`PvReader`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, warn};
use va_core::{ErrorInfo, PvAccess, PvName, PvValue, VaError};
use va_stage::{FluctuationTable, PvEntry, Refresh};

/// One published PV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PvRecord {
    /// Client access mode.
    pub access: PvAccess,
    /// Refresh policy.
    pub refresh: Refresh,
    /// Last published value.
    pub value: PvValue,
}

type Records = Arc<RwLock<BTreeMap<String, PvRecord>>>;

fn read(records: &Records) -> RwLockReadGuard<'_, BTreeMap<String, PvRecord>> {
    records.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(records: &Records) -> RwLockWriteGuard<'_, BTreeMap<String, PvRecord>> {
    records.write().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only handle on the PV database.
#[derive(Debug, Clone)]
pub struct PvReader {
    records: Records,
}

impl PvReader {
    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<PvValue> {
        read(&self.records).get(name).map(|record| record.value.clone())
    }

    /// Access mode of `name`.
    pub fn access(&self, name: &str) -> Option<PvAccess> {
        read(&self.records).get(name).map(|record| record.access)
    }

    /// Copy of every record, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, PvRecord> {
        read(&self.records).clone()
    }

    /// Copy of every value, sorted by name.
    pub fn values(&self) -> BTreeMap<String, PvValue> {
        read(&self.records)
            .iter()
            .map(|(name, record)| (name.clone(), record.value.clone()))
            .collect()
    }

    /// Number of PVs.
    pub fn len(&self) -> usize {
        read(&self.records).len()
    }

    /// Returns `true` when no PV is registered.
    pub fn is_empty(&self) -> bool {
        read(&self.records).is_empty()
    }
}

/// PV table of all areas plus the routing of client writes.
#[derive(Debug)]
pub struct PvDatabase {
    records: Records,
    routes: BTreeMap<String, usize>,
    fluctuations: FluctuationTable,
}

impl PvDatabase {
    /// Empty database adding `fluctuations` to dynamic values.
    pub fn new(fluctuations: FluctuationTable) -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            routes: BTreeMap::new(),
            fluctuations,
        }
    }

    /// Registers the PVs of the area with index `route` and section `prefix`.
    ///
    /// Values start at zero until `initial` provides one.
    pub fn register_area(
        &mut self,
        route: usize,
        prefix: &str,
        table: Vec<PvEntry>,
        initial: Vec<(String, PvValue)>,
    ) -> Result<(), VaError> {
        if let Some(previous) = self.routes.insert(prefix.to_string(), route) {
            return Err(VaError::Config(
                ErrorInfo::new("duplicate-area", "two areas share a section prefix")
                    .with_context("prefix", prefix)
                    .with_context("routes", format!("{previous},{route}")),
            ));
        }
        let mut initial: BTreeMap<String, PvValue> = initial.into_iter().collect();
        let mut records = write(&self.records);
        for entry in table {
            let value = initial
                .remove(&entry.name)
                .unwrap_or(PvValue::Scalar(0.0));
            records.insert(
                entry.name,
                PvRecord {
                    access: entry.access,
                    refresh: entry.refresh,
                    value,
                },
            );
        }
        Ok(())
    }

    /// Read-only handle sharing this database.
    pub fn reader(&self) -> PvReader {
        PvReader {
            records: Arc::clone(&self.records),
        }
    }

    /// Stores a value computed by an area; dynamic PVs get their fluctuation.
    pub fn apply_update(&mut self, pv: &str, value: PvValue) {
        let mut records = write(&self.records);
        let Some(record) = records.get_mut(pv) else {
            warn!(pv, "update for an unregistered pv dropped");
            return;
        };
        record.value = if record.refresh == Refresh::Dynamic {
            self.fluctuations.apply(pv, value)
        } else {
            value
        };
    }

    /// Validates a client write and returns the route of the owning area.
    ///
    /// The value is stored immediately; the area confirms or corrects it
    /// through later updates.
    pub fn client_write(&mut self, pv: &str, value: PvValue) -> Result<usize, VaError> {
        let mut records = write(&self.records);
        let Some(record) = records.get_mut(pv) else {
            warn!(pv, "!write unknown pv");
            return Err(VaError::Pv(
                ErrorInfo::new("unknown-pv", "no area publishes this pv").with_context("pv", pv),
            ));
        };
        if !record.access.is_writable() {
            warn!(pv, access = ?record.access, "!write");
            return Err(VaError::Pv(
                ErrorInfo::new("read-only-pv", "pv does not accept client writes")
                    .with_context("pv", pv)
                    .with_hint("write the matching -SP, -Sel or -Cmd pv"),
            ));
        }
        let section = PvName::parse(pv)?.section;
        let route = self.routes.get(&section).copied().ok_or_else(|| {
            VaError::Pv(
                ErrorInfo::new("unrouted-pv", "no area owns the pv section")
                    .with_context("pv", pv)
                    .with_context("section", section.clone()),
            )
        })?;
        debug!(pv, route, "client write accepted");
        record.value = value;
        Ok(route)
    }
}
