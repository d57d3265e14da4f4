//! Service wiring
//!
//! Builds every refresh service over one store so the HTTP layer, the worker
//! pool and the scheduler share the same registry, queue and ledger.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::features::FeatureState;
use crate::middleware::ApiTokenAuth;
use crate::provider::Provider;
use crate::refresh::{
    Enqueuer, HealthMonitor, LeaseReaper, QuotaLedger, RefreshQueue, RefreshScheduler, Registry,
    StalenessDetector, WorkerDeps, WorkerPool,
};
use crate::store::{RefreshStore, RegistrySource};

/// Every long-lived service the server runs
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<Registry>,
    pub queue: Arc<RefreshQueue>,
    pub quota: Arc<QuotaLedger>,
    pub staleness: Arc<StalenessDetector>,
    pub enqueuer: Arc<Enqueuer>,
    pub monitor: Arc<HealthMonitor>,
    pub reaper: Arc<LeaseReaper>,
    pub worker_deps: WorkerDeps,
    pub registry_source: Arc<dyn RegistrySource>,
    pub auth: ApiTokenAuth,
    config: Config,
}

impl Services {
    /// Wire services over `store`. The registry starts from the built-in
    /// defaults; call [`Services::load_registry`] to pick up stored entries.
    pub fn build<S>(config: &Config, store: Arc<S>, provider: Arc<dyn Provider>) -> Self
    where
        S: RefreshStore + 'static,
    {
        let refresh = &config.refresh;
        let registry = Arc::new(Registry::with_defaults());

        let queue = Arc::new(RefreshQueue::new(
            store.clone(),
            registry.clone(),
            refresh.retry_policy(),
        ));
        let quota = Arc::new(QuotaLedger::new(store.clone(), refresh.quota_daily_cap_bytes));
        let staleness = Arc::new(StalenessDetector::new(registry.clone(), store.clone()));
        let enqueuer = Arc::new(Enqueuer::new(
            queue.clone(),
            store.clone(),
            store.clone(),
            refresh.active_window(),
            refresh.sweep_interval_minutes(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            refresh.monitored_jobs(),
            refresh.health_buffer_minutes,
        ));
        let reaper = Arc::new(LeaseReaper::new(queue.clone(), refresh.lease_timeout()));

        let worker_deps = WorkerDeps {
            queue: queue.clone(),
            registry: registry.clone(),
            quota: quota.clone(),
            staleness: staleness.clone(),
            provider,
            sink: store.clone(),
            health: store.clone(),
        };

        Self {
            registry,
            queue,
            quota,
            staleness,
            enqueuer,
            monitor,
            reaper,
            worker_deps,
            registry_source: store,
            auth: ApiTokenAuth::new(config.auth.api_tokens.clone()),
            config: config.clone(),
        }
    }

    /// Replace the default registry with the stored entries. Failures keep
    /// the defaults.
    pub async fn load_registry(&self) {
        if let Err(e) = self.registry.refresh_from(self.registry_source.as_ref()).await {
            tracing::warn!(error = %e, "Using built-in registry defaults");
        }
        tracing::info!(entries = self.registry.len(), "Registry loaded");
    }

    pub fn feature_state(&self) -> FeatureState {
        FeatureState {
            queue: self.queue.clone(),
            enqueuer: self.enqueuer.clone(),
            monitor: self.monitor.clone(),
            auth: self.auth.clone(),
        }
    }

    pub fn scheduler(&self) -> RefreshScheduler {
        RefreshScheduler {
            enqueuer: self.enqueuer.clone(),
            reaper: self.reaper.clone(),
            registry: self.registry.clone(),
            registry_source: self.registry_source.clone(),
            monitor: self.monitor.clone(),
            health: self.worker_deps.health.clone(),
            settings: self.config.refresh.schedule(),
        }
    }

    /// Start the worker pool and periodic tasks. Both stop when `shutdown`
    /// turns true.
    pub fn start_background(&self, shutdown: watch::Receiver<bool>) -> Background {
        let pool = WorkerPool::spawn(
            self.worker_deps.clone(),
            self.config.refresh.worker_pool(),
            shutdown.clone(),
        );
        let tasks = self.scheduler().start(shutdown);
        Background { pool, tasks }
    }
}

/// Handles for the background work started by [`Services::start_background`]
pub struct Background {
    pool: WorkerPool,
    tasks: Vec<JoinHandle<()>>,
}

impl Background {
    pub async fn join(self) {
        self.pool.join().await;
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Periodic task panicked");
            }
        }
    }
}
