//! refreshq Server - Main entry point

use std::sync::Arc;

use anyhow::{Context, Result};
use refreshq_common::logging::{init_logging, LogConfig};
use tokio::sync::watch;
use tracing::{info, warn};

use refreshq_server::{
    api,
    config::{Config, StorageBackend},
    db,
    provider::{HttpProvider, Provider},
    services::Services,
    store::{MemoryStore, PgStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("refreshq-server")
        .filter_directives("refreshq_server=debug,tower_http=debug,sqlx=info")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting refreshq server");

    let config = Config::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        storage = ?config.storage,
        "Configuration loaded"
    );

    let provider: Arc<dyn Provider> = Arc::new(
        HttpProvider::new(&config.provider).context("Failed to initialize provider client")?,
    );

    let services = match config.storage {
        StorageBackend::Postgres => {
            let pool = db::create_pool(&db::DbConfig::from(&config.database))
                .await
                .context("Failed to connect to database")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            Services::build(&config, Arc::new(PgStore::new(pool)), provider)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; queue state is lost on restart");
            Services::build(&config, Arc::new(MemoryStore::new()), provider)
        }
    };

    services.load_registry().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = if config.refresh.workers_enabled {
        Some(services.start_background(shutdown_rx))
    } else {
        info!("Workers disabled (WORKERS_ENABLED=false)");
        None
    };

    let router = api::create_router(services.feature_state(), &config);
    let served = api::serve(router, &config).await;

    let _ = shutdown_tx.send(true);
    if let Some(background) = background {
        background.join().await;
        info!("Background tasks stopped");
    }

    served
}
