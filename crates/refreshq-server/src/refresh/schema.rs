//! Strict provider payload schemas
//!
//! Every data type has a typed record. A provider response must be a
//! non-empty JSON array whose elements all deserialize into that record and
//! describe the requested entity. Unknown extra fields are ignored; missing
//! or null required fields fail validation.
//!
//! The source timestamp is read from whichever field the registry entry
//! names, so a registry reload changes it without a deploy.

use chrono::{DateTime, NaiveDateTime, Utc};
use refreshq_common::{DataType, EntityKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{RefreshError, RefreshResult};
use super::registry::RegistryEntry;

/// Format of statement `acceptedDate` values, interpreted as UTC.
pub const ACCEPTED_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Contract every typed provider record fulfils
pub trait RecordSchema: DeserializeOwned + Serialize {
    /// Identifier the record describes (ticker or exchange code)
    fn entity_key(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    /// Unix seconds of the last trade
    pub timestamp: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub changes_percentage: Option<f64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub exchange: Option<String>,
}

impl RecordSchema for Quote {
    fn entity_key(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyProfile {
    pub symbol: String,
    pub company_name: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub exchange_short_name: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mkt_cap: Option<f64>,
}

impl RecordSchema for CompanyProfile {
    fn entity_key(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeStatement {
    pub symbol: String,
    /// Fiscal period end, `YYYY-MM-DD`
    pub date: String,
    pub accepted_date: String,
    pub period: String,
    pub revenue: f64,
    pub net_income: f64,
    #[serde(default)]
    pub reported_currency: Option<String>,
    #[serde(default)]
    pub gross_profit: Option<f64>,
    #[serde(default)]
    pub operating_income: Option<f64>,
    #[serde(default)]
    pub eps: Option<f64>,
}

impl RecordSchema for IncomeStatement {
    fn entity_key(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSheet {
    pub symbol: String,
    pub date: String,
    pub accepted_date: String,
    pub period: String,
    pub total_assets: f64,
    pub total_liabilities: f64,
    #[serde(default)]
    pub reported_currency: Option<String>,
    #[serde(default)]
    pub total_stockholders_equity: Option<f64>,
    #[serde(default)]
    pub cash_and_cash_equivalents: Option<f64>,
    #[serde(default)]
    pub total_debt: Option<f64>,
}

impl RecordSchema for BalanceSheet {
    fn entity_key(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowStatement {
    pub symbol: String,
    pub date: String,
    pub accepted_date: String,
    pub period: String,
    pub operating_cash_flow: f64,
    pub free_cash_flow: f64,
    #[serde(default)]
    pub reported_currency: Option<String>,
    #[serde(default)]
    pub capital_expenditure: Option<f64>,
    #[serde(default)]
    pub dividends_paid: Option<f64>,
}

impl RecordSchema for CashFlowStatement {
    fn entity_key(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    /// Exchange code, e.g. `NASDAQ`
    pub exchange: String,
    pub name: String,
    #[serde(default)]
    pub country_name: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl RecordSchema for Exchange {
    fn entity_key(&self) -> &str {
        &self.exchange
    }
}

/// Validated payload ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Normalized JSON array of the typed records
    pub payload: Value,
    /// Latest source timestamp across the records
    pub source_timestamp: Option<DateTime<Utc>>,
    pub record_count: usize,
}

/// Read a source timestamp value.
///
/// Integers are Unix seconds. Strings are RFC 3339 or
/// [`ACCEPTED_DATE_FORMAT`] in UTC.
fn source_timestamp(item: &Value, field: &str) -> Result<DateTime<Utc>, String> {
    match item.get(field) {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| format!("{} {} out of range", field, n)),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, ACCEPTED_DATE_FORMAT).map(|dt| dt.and_utc())
            })
            .map_err(|e| format!("invalid {} '{}': {}", field, raw, e)),
        Some(Value::Null) | None => Err(format!("missing source timestamp field '{}'", field)),
        Some(other) => Err(format!("{} has unsupported value {}", field, other)),
    }
}

fn parse_typed<T: RecordSchema>(
    entry: &RegistryEntry,
    entity_key: &EntityKey,
    body: Value,
) -> RefreshResult<ParsedRecord> {
    let data_type = entry.data_type;
    let field = entry.source_timestamp_field.as_deref();
    let invalid = |message: String| RefreshError::validation(data_type, message);

    let Value::Array(items) = body else {
        return Err(invalid("expected a JSON array".to_string()));
    };
    if items.is_empty() {
        return Err(invalid(format!("no records returned for {}", entity_key)));
    }

    let mut records: Vec<T> = Vec::with_capacity(items.len());
    let mut latest: Option<DateTime<Utc>> = None;
    for (index, item) in items.into_iter().enumerate() {
        if let Some(field) = field {
            let ts = source_timestamp(&item, field)
                .map_err(|e| invalid(format!("record {}: {}", index, e)))?;
            latest = Some(latest.map_or(ts, |current| current.max(ts)));
        }

        let record: T = serde_json::from_value(item)
            .map_err(|e| invalid(format!("record {}: {}", index, e)))?;

        if !record.entity_key().eq_ignore_ascii_case(entity_key.as_str()) {
            return Err(invalid(format!(
                "record {} describes '{}', expected '{}'",
                index,
                record.entity_key(),
                entity_key
            )));
        }
        records.push(record);
    }

    let payload = serde_json::to_value(&records).map_err(|e| {
        RefreshError::Storage(format!("failed to encode {} records: {}", data_type, e))
    })?;

    Ok(ParsedRecord {
        payload,
        source_timestamp: latest,
        record_count: records.len(),
    })
}

/// Parse and validate a raw provider body against its registry entry.
pub fn parse(
    entry: &RegistryEntry,
    entity_key: &EntityKey,
    body: &[u8],
) -> RefreshResult<ParsedRecord> {
    let data_type = entry.data_type;
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RefreshError::validation(data_type, format!("malformed JSON: {}", e)))?;

    match data_type {
        DataType::Quote => parse_typed::<Quote>(entry, entity_key, value),
        DataType::CompanyProfile => parse_typed::<CompanyProfile>(entry, entity_key, value),
        DataType::IncomeStatement => parse_typed::<IncomeStatement>(entry, entity_key, value),
        DataType::BalanceSheet => parse_typed::<BalanceSheet>(entry, entity_key, value),
        DataType::CashFlowStatement => parse_typed::<CashFlowStatement>(entry, entity_key, value),
        DataType::ExchangeMetadata => parse_typed::<Exchange>(entry, entity_key, value),
    }
}
