use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{DataItem, UpdateGroup};
use crate::rpc::client::NodeTransport;
use crate::storage::DataStore;

/// Count trigger at the core origin. A single-writer actor owns the update
/// counter; the eager role sends one message per applied write. When the
/// counter reaches the threshold, the last `threshold` applied items are
/// shipped to the tier-1 primary in apply order. The counter resets only on
/// acknowledgement; an unacknowledged batch keeps the counter and the next
/// applied write re-checks the threshold.
pub struct OriginSync;

impl OriginSync {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        node_id: String,
        store: Arc<DataStore>,
        downstream: Arc<dyn NodeTransport>,
        threshold: usize,
        fanout_timeout: Duration,
        mut applied_rx: mpsc::Receiver<DataItem>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut counter: usize = 0;
            info!(%node_id, threshold, "origin sync actor started");

            loop {
                let item = tokio::select! {
                    maybe = applied_rx.recv() => match maybe {
                        Some(item) => item,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };

                counter += 1;
                debug!(key = item.key, counter, "write counted toward tier-1 sync");
                if counter < threshold {
                    continue;
                }

                let items = store.recent_updates(threshold).await;
                let group = UpdateGroup {
                    count: items.len() as i32,
                    items,
                    source_node: node_id.clone(),
                    source_tier: 0,
                };

                let outcome =
                    tokio::time::timeout(fanout_timeout, downstream.sync_updates(&group)).await;
                match outcome {
                    Ok(Ok(ack)) if ack.success => {
                        info!(
                            %node_id,
                            sent = group.count,
                            to = downstream.target(),
                            "tier-1 sync acknowledged"
                        );
                        counter = 0;
                    }
                    Ok(Ok(ack)) => {
                        warn!(%node_id, "tier-1 sync nacked, keeping counter: {}", ack.message);
                    }
                    Ok(Err(e)) => {
                        warn!(%node_id, "tier-1 sync failed, keeping counter: {}", e);
                    }
                    Err(_) => {
                        warn!(%node_id, "tier-1 sync timed out, keeping counter");
                    }
                }
            }

            debug!(%node_id, "origin sync actor stopped");
        })
    }
}
