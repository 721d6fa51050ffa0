//! berth Machine Manager
//!
//! Hosts the machine manager for a single node: registers the instance
//! providers, opens the snapshot store, runs the cleanup worker, and
//! destroys every machine on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_machine_manager::config::Config;
use berth_machine_manager::provider::local::LocalProvider;
use berth_machine_manager::provider::mock::MockProvider;
use berth_machine_manager::snapshot::{InMemorySnapshotStore, SqliteSnapshotStore};
use berth_machine_manager::{CleanupWorker, MachineManager, ProviderRegistry, SnapshotStore};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        data_dir = %config.data_dir.display(),
        provision_timeout_secs = config.provision_timeout.as_secs(),
        dev = config.dev,
        "Starting berth machine manager"
    );

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(
        LocalProvider::new(&config.data_dir).with_timeout(config.provision_timeout),
    ))?;
    if config.dev {
        providers.register(Arc::new(
            MockProvider::new().with_timeout(config.provision_timeout),
        ))?;
    }

    let snapshots: Arc<dyn SnapshotStore> = match &config.snapshot_db {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let store = SqliteSnapshotStore::open(path)
                .with_context(|| format!("failed to open snapshot store {}", path.display()))?;
            info!(path = %path.display(), "Snapshot store opened");
            Arc::new(store)
        }
        None => Arc::new(InMemorySnapshotStore::new()),
    };

    let cleaner = Arc::new(CleanupWorker::new(config.cleanup.clone()));
    let manager = Arc::new(MachineManager::new(providers, snapshots, Arc::clone(&cleaner)));
    info!(machine_types = ?manager.providers().machine_types(), "Machine manager ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleaner_handle = tokio::spawn({
        let cleaner = Arc::clone(&cleaner);
        async move { cleaner.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    manager.shutdown().await;

    // The worker makes one last pass over destroys that failed during shutdown.
    let _ = shutdown_tx.send(true);
    if let Err(e) = cleaner_handle.await {
        error!(error = %e, "Cleanup worker task panicked");
    }

    info!("Machine manager shutdown complete");
    Ok(())
}
