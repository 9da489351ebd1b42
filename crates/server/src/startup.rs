//! Server startup: status store selection, service wiring and background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use stupid_export::store::RedisBackend;
use stupid_export::{ExportService, StatusStore};

use crate::source::JsonlRecordSource;

/// How often finished job handles are dropped from the job table.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Open the configured status store backend.
pub async fn build_status_store(config: &stupid_core::Config) -> anyhow::Result<StatusStore> {
    let ttl = config.export.status_ttl();
    match config.status_store.backend.as_str() {
        "redis" => {
            let url = config
                .status_store
                .redis_url
                .as_deref()
                .context("STATUS_STORE_BACKEND=redis requires REDIS_URL")?;
            let backend = RedisBackend::connect(url)
                .await
                .context("failed to connect Redis status store")?;
            info!("Status store: redis (ttl {}s)", ttl.as_secs());
            Ok(StatusStore::new(Arc::new(backend), ttl))
        }
        _ => {
            info!("Status store: in-memory (ttl {}s)", ttl.as_secs());
            Ok(StatusStore::in_memory(ttl))
        }
    }
}

/// Build the export service over the JSONL records directory.
pub async fn build_export_service(config: &stupid_core::Config) -> anyhow::Result<Arc<ExportService>> {
    let store = build_status_store(config).await?;
    let source = JsonlRecordSource::new(&config.storage.records_dir);
    info!("Record source: {}", source.dir().display());
    Ok(Arc::new(ExportService::from_settings(
        Arc::new(source),
        store,
        &config.export,
    )))
}

/// Spawn the cleanup sweeper and the job-table reaper.
///
/// Both stop when `shutdown` is notified.
pub fn spawn_background(service: &Arc<ExportService>, shutdown: &Arc<Notify>) -> Vec<JoinHandle<()>> {
    let sweeper = tokio::spawn(service.sweeper().clone().run_forever(shutdown.clone()));

    let reap_service = service.clone();
    let reap_shutdown = shutdown.clone();
    let reaper = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REAP_INTERVAL) => {
                    let reaped = reap_service.reap_finished().await;
                    if reaped > 0 {
                        debug!(reaped, "Reaped finished export tasks");
                    }
                }
                _ = reap_shutdown.notified() => break,
            }
        }
    });

    vec![sweeper, reaper]
}
