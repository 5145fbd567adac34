// ABOUTME: Entry point for the insightdeck storage process.
// ABOUTME: Loads config, opens SQLite, hydrates the cache, runs the flush loop until Ctrl-C, then drains.

use std::sync::Arc;

use anyhow::Context;
use insightdeck_store::{HybridStorage, SqliteStore, StorageConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("insightdeck=debug")),
        )
        .init();

    let config = StorageConfig::from_env().context("invalid storage configuration")?;
    tracing::info!(path = %config.database_path.display(), "insightdeck starting up");

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let storage = HybridStorage::new(Arc::new(store), config);

    let report = storage.init().await;
    if !report.is_complete() {
        tracing::warn!(
            skipped_rows = report.skipped_rows,
            email_conflicts = report.email_conflicts,
            failed_kinds = ?report.failed_kinds,
            "hydration was partial"
        );
    }
    tracing::info!(entities = report.total(), "storage ready, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutting down");
    let drained = storage.shutdown().await;
    let dead_letters = storage.dead_letters().await;
    for dead in &dead_letters {
        tracing::error!(key = %dead.key, op = dead.op.name(), error = %dead.error, "write was never persisted");
    }
    tracing::info!(persisted = drained.persisted, dead_letters = dead_letters.len(), "bye");

    Ok(())
}
