//! Staleness detection
//!
//! A record is stale once its age reaches the registry TTL. For data types
//! carrying a source timestamp, a fetched payload must also be strictly
//! newer than the one already stored.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use refreshq_common::{DataType, EntityKey};

use super::error::{RefreshError, RefreshResult};
use super::registry::Registry;
use crate::store::RefreshStateStore;

/// Age rule: stale when `now - last_fetched_at >= ttl`.
pub fn is_age_stale(last_fetched_at: DateTime<Utc>, now: DateTime<Utc>, ttl_minutes: i64) -> bool {
    now - last_fetched_at >= Duration::minutes(ttl_minutes)
}

/// Source timestamp rule: the incoming payload must be strictly newer.
pub fn check_source_timestamp(
    entity_key: &EntityKey,
    data_type: DataType,
    incoming: DateTime<Utc>,
    stored: DateTime<Utc>,
) -> RefreshResult<()> {
    if incoming <= stored {
        return Err(RefreshError::StalenessViolation {
            entity_key: entity_key.clone(),
            data_type,
            incoming,
            stored,
        });
    }
    Ok(())
}

pub struct StalenessDetector {
    registry: Arc<Registry>,
    store: Arc<dyn RefreshStateStore>,
}

impl StalenessDetector {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn RefreshStateStore>) -> Self {
        Self { registry, store }
    }

    /// Whether the stored record is too old to trust. No stored record is stale.
    pub async fn is_stale(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
        now: DateTime<Utc>,
    ) -> RefreshResult<bool> {
        let entry = self.registry.lookup(data_type)?;
        let state = self.store.refresh_state(entity_key, data_type).await?;

        Ok(state.map_or(true, |s| is_age_stale(s.last_fetched_at, now, entry.ttl_minutes)))
    }

    /// Check a fetched payload's source timestamp against the stored one.
    ///
    /// Data types without a source timestamp field always pass. When the field
    /// is defined but the payload carries none, the payload has drifted from
    /// its schema.
    pub async fn validate_source_timestamp(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
        incoming: Option<DateTime<Utc>>,
    ) -> RefreshResult<()> {
        let entry = self.registry.lookup(data_type)?;
        let Some(field) = entry.source_timestamp_field.as_deref() else {
            return Ok(());
        };

        let incoming = incoming.ok_or_else(|| {
            RefreshError::validation(
                data_type,
                format!("missing source timestamp field '{}'", field),
            )
        })?;

        let stored = self
            .store
            .refresh_state(entity_key, data_type)
            .await?
            .and_then(|s| s.source_timestamp);

        match stored {
            Some(stored) => check_source_timestamp(entity_key, data_type, incoming, stored),
            None => Ok(()),
        }
    }
}
