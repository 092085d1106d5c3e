/// Station Hub Sync Core - standalone entry point
///
/// Runs the sync core against a configured station gateway and logs store
/// updates. The dashboard embeds `SyncContext` directly; this binary exists
/// for soak-testing a gateway without the UI.
use anyhow::Result;
use stationhub_core::{load_dotenv, ConfigLoader, SyncConfig};
use stationhub_sync::{init_tracing, HttpChannelTransport, HttpSnapshotClient, SyncContext};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    init_tracing();

    let config = SyncConfig::from_env()?;
    config.validate()?;

    let transport = Arc::new(HttpChannelTransport::new(config.channel_url.clone()));
    let snapshot = Arc::new(HttpSnapshotClient::new(config.snapshot_url.clone()));
    let context = SyncContext::new(config, transport, snapshot);

    let mut batches = context.store().watch();
    tokio::spawn(async move {
        while batches.changed().await.is_ok() {
            let map = batches.borrow_and_update().clone();
            tracing::info!(batches = map.len(), "store updated");
        }
    });

    let mut notifications = context.notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            tracing::warn!(batch = ?notification.batch_id, "{}", notification.message);
        }
    });

    tracing::info!("station hub sync core starting");
    context.run().await;
    Ok(())
}
