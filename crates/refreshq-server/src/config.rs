//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::refresh::health::{
    MonitoredJob, DEFAULT_BUFFER_MINUTES, LEASE_REAPER_JOB, REFRESH_WORKER_JOB,
    STALENESS_SWEEP_JOB,
};
use crate::refresh::retry::{
    RetryPolicy, DEFAULT_BASE_DELAY_SECS, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_SECS,
};
use crate::refresh::scheduler::{interval_minutes, ScheduleSettings};
use crate::refresh::worker::WorkerPoolSettings;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/refreshq";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Provider Constants
// ============================================================================

/// Default provider base URL.
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://financialmodelingprep.com/api/v3";

/// Default provider request timeout in seconds.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Refresh Queue Constants
// ============================================================================

/// Default daily provider quota in bytes (5 GiB).
pub const DEFAULT_QUOTA_DAILY_CAP_BYTES: i64 = 5 * 1024 * 1024 * 1024;

/// Default lease timeout before a processing job is reclaimed (10 minutes).
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 600;

/// Default interval between lease reaper runs.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

/// Default interval between staleness sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default window in which a subscribed entity counts as active (1 hour).
pub const DEFAULT_ACTIVE_WINDOW_MINUTES: i64 = 60;

/// Default interval between registry reloads.
pub const DEFAULT_REGISTRY_REFRESH_SECS: u64 = 900;

/// Default number of refresh workers.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Default idle poll interval of a worker.
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 1000;

/// Default spacing between worker heartbeats.
pub const DEFAULT_WORKER_HEARTBEAT_SECS: u64 = 30;

/// Default interval between health audits.
pub const DEFAULT_HEALTH_AUDIT_SECS: u64 = 60;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env_string(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub provider: ProviderConfig,
    pub refresh: RefreshConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Where queue state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Invalid storage backend: {}", other)),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// Recycle connections after this many seconds when set
    pub max_lifetime_secs: Option<u64>,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Bearer tokens accepted on write endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(skip_serializing)]
    pub api_tokens: Vec<String>,
}

/// Provider client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// Refresh queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub quota_daily_cap_bytes: i64,
    pub lease_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub active_window_minutes: i64,
    pub registry_refresh_secs: u64,
    /// Run workers and periodic tasks in this process
    pub workers_enabled: bool,
    pub worker_concurrency: usize,
    pub worker_poll_interval_ms: u64,
    pub worker_heartbeat_secs: u64,
    pub retry_max_attempts: i32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_jitter_fraction: f64,
    pub health_buffer_minutes: i64,
    pub health_audit_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            quota_daily_cap_bytes: DEFAULT_QUOTA_DAILY_CAP_BYTES,
            lease_timeout_secs: DEFAULT_LEASE_TIMEOUT_SECS,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            active_window_minutes: DEFAULT_ACTIVE_WINDOW_MINUTES,
            registry_refresh_secs: DEFAULT_REGISTRY_REFRESH_SECS,
            workers_enabled: true,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            worker_poll_interval_ms: DEFAULT_WORKER_POLL_INTERVAL_MS,
            worker_heartbeat_secs: DEFAULT_WORKER_HEARTBEAT_SECS,
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            retry_max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            retry_jitter_fraction: DEFAULT_JITTER_FRACTION,
            health_buffer_minutes: DEFAULT_BUFFER_MINUTES,
            health_audit_secs: DEFAULT_HEALTH_AUDIT_SECS,
        }
    }
}

impl RefreshConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            quota_daily_cap_bytes: env_or("QUOTA_DAILY_CAP_BYTES", d.quota_daily_cap_bytes),
            lease_timeout_secs: env_or("LEASE_TIMEOUT_SECS", d.lease_timeout_secs),
            reaper_interval_secs: env_or("REAPER_INTERVAL_SECS", d.reaper_interval_secs),
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            active_window_minutes: env_or("ACTIVE_WINDOW_MINUTES", d.active_window_minutes),
            registry_refresh_secs: env_or("REGISTRY_REFRESH_SECS", d.registry_refresh_secs),
            workers_enabled: env_or("WORKERS_ENABLED", d.workers_enabled),
            worker_concurrency: env_or("WORKER_CONCURRENCY", d.worker_concurrency),
            worker_poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", d.worker_poll_interval_ms),
            worker_heartbeat_secs: env_or("WORKER_HEARTBEAT_SECS", d.worker_heartbeat_secs),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", d.retry_max_attempts),
            retry_base_delay_secs: env_or("RETRY_BASE_DELAY_SECS", d.retry_base_delay_secs),
            retry_max_delay_secs: env_or("RETRY_MAX_DELAY_SECS", d.retry_max_delay_secs),
            retry_jitter_fraction: env_or("RETRY_JITTER_FRACTION", d.retry_jitter_fraction),
            health_buffer_minutes: env_or("HEALTH_BUFFER_MINUTES", d.health_buffer_minutes),
            health_audit_secs: env_or("HEALTH_AUDIT_SECS", d.health_audit_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            jitter_fraction: self.retry_jitter_fraction,
        }
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_timeout_secs as i64)
    }

    pub fn active_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.active_window_minutes)
    }

    pub fn sweep_interval_minutes(&self) -> i64 {
        interval_minutes(Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn schedule(&self) -> ScheduleSettings {
        ScheduleSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            registry_refresh_interval: Duration::from_secs(self.registry_refresh_secs),
            health_audit_interval: Duration::from_secs(self.health_audit_secs),
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolSettings {
        WorkerPoolSettings {
            concurrency: self.worker_concurrency,
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            heartbeat_every: Duration::from_secs(self.worker_heartbeat_secs),
            heartbeat_interval_minutes: interval_minutes(Duration::from_secs(
                self.worker_heartbeat_secs,
            )),
        }
    }

    /// The periodic jobs the health monitor audits, with their expected intervals.
    pub fn monitored_jobs(&self) -> Vec<MonitoredJob> {
        vec![
            MonitoredJob::new(STALENESS_SWEEP_JOB, self.sweep_interval_minutes()),
            MonitoredJob::new(
                LEASE_REAPER_JOB,
                interval_minutes(Duration::from_secs(self.reaper_interval_secs)),
            ),
            MonitoredJob::new(
                REFRESH_WORKER_JOB,
                interval_minutes(Duration::from_secs(self.worker_heartbeat_secs)),
            ),
        ]
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let storage = match env_string("REFRESHQ_STORAGE") {
            Some(raw) => raw.parse()?,
            None => StorageBackend::Postgres,
        };

        let config = Config {
            server: ServerConfig {
                host: env_string("REFRESHQ_HOST")
                    .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("REFRESHQ_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "REFRESHQ_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            storage,
            database: DatabaseConfig {
                url: env_string("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
                max_lifetime_secs: env_string("DATABASE_MAX_LIFETIME")
                    .and_then(|s| s.trim().parse().ok()),
            },
            cors: CorsConfig {
                allowed_origins: env_string("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true),
            },
            auth: AuthConfig {
                api_tokens: env_list("REFRESHQ_API_TOKENS"),
            },
            provider: ProviderConfig {
                base_url: env_string("PROVIDER_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string()),
                api_key: env_string("PROVIDER_API_KEY"),
                timeout_secs: env_or("PROVIDER_TIMEOUT_SECS", DEFAULT_PROVIDER_TIMEOUT_SECS),
            },
            refresh: RefreshConfig::from_env(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.storage == StorageBackend::Postgres {
            if self.database.url.is_empty() {
                anyhow::bail!("Database URL cannot be empty");
            }

            if self.database.max_connections == 0 {
                anyhow::bail!("Database max_connections must be greater than 0");
            }

            if self.database.min_connections > self.database.max_connections {
                anyhow::bail!(
                    "Database min_connections ({}) cannot be greater than max_connections ({})",
                    self.database.min_connections,
                    self.database.max_connections
                );
            }
        }

        let refresh = &self.refresh;
        if refresh.quota_daily_cap_bytes <= 0 {
            anyhow::bail!("QUOTA_DAILY_CAP_BYTES must be greater than 0");
        }

        if refresh.worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be greater than 0");
        }

        if refresh.retry_max_attempts < 1 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }

        if !(0.0..=1.0).contains(&refresh.retry_jitter_fraction) {
            anyhow::bail!(
                "RETRY_JITTER_FRACTION must be between 0 and 1, got {}",
                refresh.retry_jitter_fraction
            );
        }

        if refresh.retry_base_delay_secs > refresh.retry_max_delay_secs {
            anyhow::bail!(
                "RETRY_BASE_DELAY_SECS ({}) cannot exceed RETRY_MAX_DELAY_SECS ({})",
                refresh.retry_base_delay_secs,
                refresh.retry_max_delay_secs
            );
        }

        let intervals = [
            ("LEASE_TIMEOUT_SECS", refresh.lease_timeout_secs),
            ("REAPER_INTERVAL_SECS", refresh.reaper_interval_secs),
            ("SWEEP_INTERVAL_SECS", refresh.sweep_interval_secs),
            ("REGISTRY_REFRESH_SECS", refresh.registry_refresh_secs),
            ("WORKER_POLL_INTERVAL_MS", refresh.worker_poll_interval_ms),
            ("WORKER_HEARTBEAT_SECS", refresh.worker_heartbeat_secs),
            ("HEALTH_AUDIT_SECS", refresh.health_audit_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if refresh.active_window_minutes <= 0 {
            anyhow::bail!("ACTIVE_WINDOW_MINUTES must be greater than 0");
        }

        if self.auth.api_tokens.is_empty() {
            tracing::warn!(
                "No API tokens configured - /track-subscription will reject every request"
            );
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            storage: StorageBackend::Postgres,
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                max_lifetime_secs: None,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
            auth: AuthConfig::default(),
            provider: ProviderConfig {
                base_url: DEFAULT_PROVIDER_BASE_URL.to_string(),
                api_key: None,
                timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            },
            refresh: RefreshConfig::default(),
        }
    }
}
