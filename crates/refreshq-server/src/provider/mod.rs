//! External market data provider
//!
//! The provider bills by bytes on the wire, so a response keeps its raw
//! body together with the size the transport declared for it.

use std::time::Duration;

use async_trait::async_trait;
use refreshq_common::{DataType, EntityKey};
use reqwest::Client;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::refresh::error::{RefreshError, RefreshResult};

/// Raw provider response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// `Content-Length` as sent by the provider, before any decoding
    pub declared_size: Option<u64>,
}

impl ProviderResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>, declared_size: Option<u64>) -> Self {
        Self {
            status,
            body: body.into(),
            declared_size,
        }
    }

    /// Bytes billed for this response.
    ///
    /// Uses the declared transport size and falls back to the undecoded body
    /// length. Never derived from re-serializing the parsed payload.
    pub fn wire_size(&self) -> u64 {
        self.declared_size.unwrap_or(self.body.len() as u64)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map a non-2xx status to its error category.
    ///
    /// The body is never copied into the error; it may echo request details.
    pub fn check_status(self, data_type: DataType) -> RefreshResult<Self> {
        if self.is_success() {
            return Ok(self);
        }

        Err(match self.status {
            429 => RefreshError::TransientNetwork("provider rate limited the request".to_string()),
            s if s >= 500 => RefreshError::TransientNetwork(format!("provider returned {}", s)),
            401 | 403 => RefreshError::Config(format!(
                "provider rejected credentials ({})",
                self.status
            )),
            s => RefreshError::validation(data_type, format!("provider returned {}", s)),
        })
    }
}

/// Source of raw provider payloads
///
/// `fetch` fails only when no response arrived. Status codes are left to
/// [`ProviderResponse::check_status`].
#[async_trait]
pub trait Provider: Send + Sync {
    async fn fetch(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
    ) -> RefreshResult<ProviderResponse>;
}

/// Endpoint path for a data type, relative to the provider base URL.
pub fn endpoint_path(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Quote => "quote",
        DataType::CompanyProfile => "profile",
        DataType::IncomeStatement => "income-statement",
        DataType::BalanceSheet => "balance-sheet-statement",
        DataType::CashFlowStatement => "cash-flow-statement",
        DataType::ExchangeMetadata => "exchanges",
    }
}

/// HTTP provider client
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> RefreshResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| RefreshError::Config("PROVIDER_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("refreshq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RefreshError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, entity_key: &EntityKey, data_type: DataType) -> String {
        format!("{}/{}/{}", self.base_url, endpoint_path(data_type), entity_key)
    }
}

/// Transport failure without the request URL, which carries the api key.
fn transport_error(data_type: DataType, stage: &str, e: reqwest::Error) -> RefreshError {
    let e = e.without_url();
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "failed"
    };
    RefreshError::TransientNetwork(format!("{} {} {}: {}", data_type, stage, kind, e))
}

#[async_trait]
impl Provider for HttpProvider {
    async fn fetch(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
    ) -> RefreshResult<ProviderResponse> {
        let url = self.url(entity_key, data_type);
        debug!(url = %url, data_type = %data_type, "Fetching from provider");

        let response = self
            .client
            .get(&url)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| transport_error(data_type, "request", e))?;

        let status = response.status().as_u16();
        let declared_size = response.content_length();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(data_type, "body read", e))?;

        debug!(
            url = %url,
            status,
            declared_size = ?declared_size,
            body_bytes = body.len(),
            "Provider responded"
        );

        Ok(ProviderResponse::new(status, body.to_vec(), declared_size))
    }
}
