//! Common types used across refreshq

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

/// Maximum accepted length of an entity key (ticker, exchange code, ...).
pub const MAX_ENTITY_KEY_LEN: usize = 32;

/// Kind of provider record kept fresh by the refresh queue.
///
/// The set is closed: every variant maps to one registry entry and one
/// typed validator on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Quote,
    CompanyProfile,
    IncomeStatement,
    BalanceSheet,
    CashFlowStatement,
    ExchangeMetadata,
}

impl DataType {
    /// Every data type, in declaration order.
    pub const ALL: [DataType; 6] = [
        DataType::Quote,
        DataType::CompanyProfile,
        DataType::IncomeStatement,
        DataType::BalanceSheet,
        DataType::CashFlowStatement,
        DataType::ExchangeMetadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Quote => "quote",
            DataType::CompanyProfile => "company_profile",
            DataType::IncomeStatement => "income_statement",
            DataType::BalanceSheet => "balance_sheet",
            DataType::CashFlowStatement => "cash_flow_statement",
            DataType::ExchangeMetadata => "exchange_metadata",
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| CommonError::UnknownDataType(s.to_string()))
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized identifier of the entity a record describes (e.g. `AAPL`).
///
/// Keys are trimmed and upper-cased so `aapl` and ` AAPL ` address the
/// same queue slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(raw: impl AsRef<str>) -> crate::Result<Self> {
        let key = raw.as_ref().trim().to_uppercase();

        if key.is_empty() {
            return Err(CommonError::InvalidEntityKey("key cannot be empty".to_string()));
        }

        if key.len() > MAX_ENTITY_KEY_LEN {
            return Err(CommonError::InvalidEntityKey(format!(
                "key must be at most {} characters",
                MAX_ENTITY_KEY_LEN
            )));
        }

        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=' | '_'))
        {
            return Err(CommonError::InvalidEntityKey(format!(
                "'{}' contains unsupported characters",
                key
            )));
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityKey {
    type Error = CommonError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        EntityKey::new(value)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
