//! Shared fixtures for refreshq server integration tests
//!
//! The harness runs against [`MemoryStore`] with a scripted provider, so
//! tests using it need no database or network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use refreshq_common::{DataType, EntityKey};
use refreshq_server::{
    config::Config,
    provider::{Provider, ProviderResponse},
    refresh::{RefreshResult, RefreshWorker},
    services::Services,
    store::MemoryStore,
};

pub const TEST_TOKEN: &str = "test-token";

pub fn key(raw: &str) -> EntityKey {
    EntityKey::new(raw).unwrap()
}

/// Provider returning a fixed response and counting calls
pub struct ScriptedProvider {
    response: Mutex<ProviderResponse>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(response: ProviderResponse) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_response(&self, response: ProviderResponse) {
        *self.response.lock().unwrap() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn fetch(
        &self,
        _entity_key: &EntityKey,
        _data_type: DataType,
    ) -> RefreshResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.lock().unwrap().clone())
    }
}

/// A quote array body for `symbol`, padded to exactly `len` bytes.
pub fn quote_body(symbol: &str, timestamp: i64, len: usize) -> Vec<u8> {
    let prefix = format!(
        r#"[{{"symbol":"{}","price":189.5,"timestamp":{},"name":""#,
        symbol, timestamp
    );
    let suffix = r#""}]"#;
    let padding = len - prefix.len() - suffix.len();
    let body = format!("{}{}{}", prefix, "x".repeat(padding), suffix);
    assert_eq!(body.len(), len);
    body.into_bytes()
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.api_tokens = vec![TEST_TOKEN.to_string()];
    config.refresh.retry_jitter_fraction = 0.0;
    config
}

pub struct TestHarness {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub services: Services,
}

impl TestHarness {
    pub fn new(provider: Arc<ScriptedProvider>) -> Self {
        Self::with_config(test_config(), provider)
    }

    pub fn with_config(config: Config, provider: Arc<ScriptedProvider>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let services = Services::build(&config, store.clone(), provider.clone());
        Self {
            config,
            store,
            provider,
            services,
        }
    }

    pub fn worker(&self) -> RefreshWorker {
        RefreshWorker::new(self.services.worker_deps.clone())
    }
}
