//! Data type registry
//!
//! Maps every [`DataType`] to where its records are stored and how fresh
//! they must be. The map is immutable once built; a reload swaps in a whole
//! new map so readers never observe a partial update.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use refreshq_common::DataType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{RefreshError, RefreshResult};
use crate::store::{validate_identifier, RegistrySource};

/// Metadata for one data type (maps to refresh_registry table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub data_type: DataType,
    /// Table validated records are upserted into
    pub storage_target: String,
    pub freshness_column: String,
    /// JSON field of the provider payload carrying the source timestamp
    pub source_timestamp_field: Option<String>,
    pub ttl_minutes: i64,
}

impl RegistryEntry {
    pub fn new(
        data_type: DataType,
        storage_target: &str,
        source_timestamp_field: Option<&str>,
        ttl_minutes: i64,
    ) -> Self {
        Self {
            data_type,
            storage_target: storage_target.to_string(),
            freshness_column: "fetched_at".to_string(),
            source_timestamp_field: source_timestamp_field.map(str::to_string),
            ttl_minutes,
        }
    }

    pub fn requires_source_timestamp(&self) -> bool {
        self.source_timestamp_field.is_some()
    }

    pub fn validate(&self) -> RefreshResult<()> {
        if !validate_identifier(&self.storage_target) {
            return Err(RefreshError::Config(format!(
                "invalid storage target '{}' for {}",
                self.storage_target, self.data_type
            )));
        }
        if !validate_identifier(&self.freshness_column) {
            return Err(RefreshError::Config(format!(
                "invalid freshness column '{}' for {}",
                self.freshness_column, self.data_type
            )));
        }
        if self.ttl_minutes <= 0 {
            return Err(RefreshError::Config(format!(
                "ttl for {} must be positive, got {}",
                self.data_type, self.ttl_minutes
            )));
        }
        Ok(())
    }
}

/// Built-in entries used when no registry table is available.
pub fn default_entries() -> Vec<RegistryEntry> {
    vec![
        RegistryEntry::new(DataType::Quote, "quotes", Some("timestamp"), 1),
        RegistryEntry::new(DataType::CompanyProfile, "company_profiles", None, 1440),
        RegistryEntry::new(
            DataType::IncomeStatement,
            "income_statements",
            Some("acceptedDate"),
            1440,
        ),
        RegistryEntry::new(DataType::BalanceSheet, "balance_sheets", Some("acceptedDate"), 1440),
        RegistryEntry::new(
            DataType::CashFlowStatement,
            "cash_flow_statements",
            Some("acceptedDate"),
            1440,
        ),
        RegistryEntry::new(DataType::ExchangeMetadata, "exchanges", None, 10080),
    ]
}

type RegistryMap = HashMap<DataType, RegistryEntry>;

/// Shared, atomically replaceable registry
#[derive(Debug)]
pub struct Registry {
    entries: RwLock<Arc<RegistryMap>>,
}

impl Registry {
    pub fn new(entries: Vec<RegistryEntry>) -> RefreshResult<Self> {
        Ok(Self {
            entries: RwLock::new(Arc::new(Self::build(entries)?)),
        })
    }

    pub fn with_defaults() -> Self {
        let map = default_entries()
            .into_iter()
            .map(|entry| (entry.data_type, entry))
            .collect();
        Self {
            entries: RwLock::new(Arc::new(map)),
        }
    }

    fn build(entries: Vec<RegistryEntry>) -> RefreshResult<RegistryMap> {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            entry.validate()?;
            map.insert(entry.data_type, entry);
        }
        Ok(map)
    }

    fn snapshot(&self) -> Arc<RegistryMap> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn lookup(&self, data_type: DataType) -> RefreshResult<RegistryEntry> {
        self.snapshot()
            .get(&data_type)
            .cloned()
            .ok_or(RefreshError::UnknownDataType(data_type))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Validate and swap in a whole new map.
    pub fn replace(&self, entries: Vec<RegistryEntry>) -> RefreshResult<()> {
        let map = Arc::new(Self::build(entries)?);
        *self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = map;
        Ok(())
    }

    /// Reload from a source. On failure the current map stays in place.
    pub async fn refresh_from(&self, source: &dyn RegistrySource) -> RefreshResult<()> {
        let entries = match source.load_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Registry reload failed, keeping previous entries");
                return Err(e);
            }
        };

        if entries.is_empty() {
            warn!("Registry source returned no entries, keeping previous entries");
            return Ok(());
        }

        let count = entries.len();
        if let Err(e) = self.replace(entries) {
            warn!(error = %e, "Registry source returned invalid entries, keeping previous entries");
            return Err(e);
        }

        info!(entries = count, "Registry reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_data_type() {
        let registry = Registry::with_defaults();
        for dt in DataType::ALL {
            let entry = registry.lookup(dt).unwrap();
            assert!(entry.validate().is_ok());
        }
        assert_eq!(registry.lookup(DataType::Quote).unwrap().ttl_minutes, 1);
    }

    #[test]
    fn test_lookup_miss_is_unknown_data_type() {
        let registry =
            Registry::new(vec![RegistryEntry::new(DataType::Quote, "quotes", None, 5)]).unwrap();
        let err = registry.lookup(DataType::BalanceSheet).unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_replace_rejects_invalid_entries_and_keeps_old_map() {
        let registry = Registry::with_defaults();
        let bad = vec![RegistryEntry::new(DataType::Quote, "quotes; --", None, 1)];
        assert!(registry.replace(bad).is_err());
        assert_eq!(registry.len(), DataType::ALL.len());

        let zero_ttl = vec![RegistryEntry::new(DataType::Quote, "quotes", None, 0)];
        assert!(registry.replace(zero_ttl).is_err());
    }

    #[test]
    fn test_replace_swaps_whole_map() {
        let registry = Registry::with_defaults();
        registry
            .replace(vec![RegistryEntry::new(DataType::Quote, "quotes", None, 15)])
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(DataType::Quote).unwrap().ttl_minutes, 15);
        assert!(registry.lookup(DataType::CompanyProfile).is_err());
    }
}
