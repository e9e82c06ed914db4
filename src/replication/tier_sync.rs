use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::TickPayload;
use crate::protocol::{current_time_secs, UpdateGroup};
use crate::rpc::client::NodeTransport;
use crate::storage::DataStore;

/// Time trigger at the tier-1 primary: an independent periodic task that
/// ships the primary's state to the tier-2 primary every interval,
/// regardless of load. A failed tick is logged and skipped; the handle
/// reconnects on the next send. The task is cancelled and awaited on stop.
pub struct TierSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TierSync {
    pub fn spawn(
        node_id: String,
        tier: i32,
        store: Arc<DataStore>,
        downstream: Arc<dyn NodeTransport>,
        interval: Duration,
        payload: TickPayload,
        fanout_timeout: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            // First tick fires one full interval after start.
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // High-water mark of versions already acknowledged downstream,
            // used by the changed-only payload mode.
            let mut synced_below: i32 = 0;

            info!(%node_id, ?interval, "tier sync ticker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let items = match payload {
                    TickPayload::FullState => store.get_all().await,
                    TickPayload::ChangedSinceLastSync => store
                        .get_all()
                        .await
                        .into_iter()
                        .filter(|item| item.version > synced_below)
                        .collect(),
                };
                let high_water = items.iter().map(|i| i.version).max().unwrap_or(synced_below);

                let group = UpdateGroup {
                    count: items.len() as i32,
                    items,
                    source_node: node_id.clone(),
                    source_tier: tier,
                };

                let outcome =
                    tokio::time::timeout(fanout_timeout, downstream.sync_updates(&group)).await;
                match outcome {
                    Ok(Ok(ack)) if ack.success => {
                        synced_below = high_water;
                        let last_sync_at = current_time_secs();
                        debug!(
                            %node_id,
                            sent = group.count,
                            to = downstream.target(),
                            at = last_sync_at,
                            "tier-2 sync acknowledged"
                        );
                    }
                    Ok(Ok(ack)) => {
                        warn!(%node_id, "tier-2 sync nacked, skipping tick: {}", ack.message);
                    }
                    Ok(Err(e)) => {
                        warn!(%node_id, "tier-2 sync failed, skipping tick: {}", e);
                    }
                    Err(_) => {
                        warn!(%node_id, "tier-2 sync timed out, skipping tick");
                    }
                }
            }
            debug!(%node_id, "tier sync ticker stopped");
        });

        Self { shutdown, handle }
    }

    /// Cancel the ticker and wait for it to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
