//! Provider quota ledger
//!
//! Tracks wire bytes per UTC day against a daily cap. The cap is soft: the
//! gate is checked before a fetch and usage is added after completion, so
//! concurrent workers can overshoot slightly.

use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};

use super::error::{RefreshError, RefreshResult};
use super::types::QuotaUsageRecord;
use crate::store::QuotaStore;

/// UTC day the quota is accounted against.
pub fn quota_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Start of the next UTC day, when the quota resets.
pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = quota_day(now);
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    daily_cap_bytes: i64,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, daily_cap_bytes: i64) -> Self {
        Self {
            store,
            daily_cap_bytes,
        }
    }

    pub fn daily_cap_bytes(&self) -> i64 {
        self.daily_cap_bytes
    }

    pub async fn usage(&self, date: NaiveDate) -> RefreshResult<QuotaUsageRecord> {
        let total_bytes = self.store.usage(date).await?;
        Ok(QuotaUsageRecord {
            date,
            total_bytes,
            exceeded: total_bytes >= self.daily_cap_bytes,
        })
    }

    pub async fn is_exceeded(&self, date: NaiveDate) -> RefreshResult<bool> {
        Ok(self.usage(date).await?.exceeded)
    }

    /// Admission gate: error with `QuotaExceeded` once the cap is reached.
    pub async fn admit(&self, now: DateTime<Utc>) -> RefreshResult<()> {
        let usage = self.usage(quota_day(now)).await?;
        if usage.exceeded {
            return Err(RefreshError::QuotaExceeded {
                used: usage.total_bytes,
                cap: self.daily_cap_bytes,
            });
        }
        Ok(())
    }
}
