use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pgroupd::config::ManagerConfig;
use pgroupd::db::{PgStore, Store};
use pgroupd::dc::{self, ConfigCache};
use pgroupd::ipc::PgmService;
use pgroupd::manager::ProxyGroupManager;
use pgroupd::status::CHECK_INTERVAL;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("pgroupd.toml"));
    let config = ManagerConfig::load(&config_path)
        .with_context(|| format!("cannot load config from {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log.level.to_filter_str()))
        .init();

    info!(config = %config_path.display(), "pgroupd starting");

    let store: Arc<dyn Store> = Arc::new(
        PgStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("cannot connect to the database")?,
    );

    let dc = Arc::new(ConfigCache::new());
    dc.refresh_from_store(store.as_ref())
        .await
        .context("cannot load proxy group configuration")?;

    let shutdown = CancellationToken::new();
    let manager = ProxyGroupManager::new(store.clone(), dc.clone(), shutdown.clone());

    // The IPC endpoint must come up before the loop starts; a bind failure
    // is fatal.
    let service = PgmService::bind(&config.ipc.socket, manager.cache().clone(), shutdown.clone())
        .context("cannot start proxy group manager service")?;
    let ipc_task = service.spawn();

    let refresher = tokio::spawn(dc::run_refresher(
        dc.clone(),
        store.clone(),
        Duration::from_secs(CHECK_INTERVAL),
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "cannot register SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown requested");
        signal_token.cancel();
    });

    let result = manager.run().await;

    shutdown.cancel();
    let _ = refresher.await;
    let _ = ipc_task.await;

    result.context("proxy group manager failed")?;
    Ok(())
}
