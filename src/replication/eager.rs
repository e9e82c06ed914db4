use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{CompensationPolicy, ReplicationConfig};
use crate::error::{NodeError, NodeResult};
use crate::protocol::{DataItem, Operation, Transaction, UpdateNotification};
use crate::rpc::client::NodeTransport;
use crate::storage::DataStore;

/// Core-layer replication role: update-everywhere, active, eager. Every
/// write is applied locally, propagated to all peers in parallel, and only
/// acknowledged to the client once every peer has acknowledged it.
pub struct EagerReplication {
    node_id: String,
    store: Arc<DataStore>,
    peers: Vec<Arc<dyn NodeTransport>>,
    fanout_timeout: Duration,
    compensation: CompensationPolicy,
    /// Applied-write feed for the origin's count trigger. None on non-origin
    /// peers.
    applied_tx: Option<mpsc::Sender<DataItem>>,
    /// Writes within one node are applied and propagated strictly in
    /// submission order.
    serial: Mutex<()>,
}

impl EagerReplication {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<DataStore>,
        peers: Vec<Arc<dyn NodeTransport>>,
        config: &ReplicationConfig,
        applied_tx: Option<mpsc::Sender<DataItem>>,
    ) -> Self {
        let node_id = node_id.into();
        info!(%node_id, peers = peers.len(), "eager replication role initialized");
        Self {
            node_id,
            store,
            peers,
            fanout_timeout: Duration::from_millis(config.fanout_timeout_ms),
            compensation: config.compensation,
            applied_tx,
            serial: Mutex::new(()),
        }
    }

    /// Execute an update transaction: writes are versioned, applied locally,
    /// and eagerly replicated one at a time; reads observe the local store
    /// at their position in the sequence. The first failed write aborts the
    /// transaction; earlier writes stand.
    pub async fn execute_update(&self, txn: &Transaction) -> NodeResult<Vec<DataItem>> {
        let _guard = self.serial.lock().await;

        let mut results = Vec::new();
        for op in &txn.operations {
            match *op {
                Operation::Write { key, value } => {
                    let prior = self.store.get(key).await;
                    let version = self.store.next_version().await;
                    let item = self.store.update(key, value, version).await?;
                    debug!(key, value, version, "applied local write");

                    if let Err(e) = self.propagate_to_peers(&item).await {
                        self.compensate(prior).await;
                        return Err(e);
                    }

                    results.push(item);
                    if let Some(tx) = &self.applied_tx {
                        // The actor draining this channel only stops at node
                        // shutdown; a closed channel here is not an error.
                        let _ = tx.send(item).await;
                    }
                }
                Operation::Read { key } => {
                    if let Some(item) = self.store.get(key).await {
                        results.push(item);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Parallel fan-out of one write to every peer. A timeout, transport
    /// error, or explicit nack from any peer fails the write.
    async fn propagate_to_peers(&self, item: &DataItem) -> NodeResult<()> {
        if self.peers.is_empty() {
            return Ok(());
        }

        let notification = UpdateNotification {
            data: *item,
            source_node: self.node_id.clone(),
        };

        let sends = self.peers.iter().map(|peer| {
            let notification = notification.clone();
            async move {
                let outcome =
                    tokio::time::timeout(self.fanout_timeout, peer.propagate_update(&notification))
                        .await;
                match outcome {
                    Ok(Ok(ack)) if ack.success => None,
                    Ok(Ok(ack)) => Some(format!("{} nacked: {}", peer.target(), ack.message)),
                    Ok(Err(e)) => Some(format!("{} failed: {}", peer.target(), e)),
                    Err(_) => Some(format!("{} timed out", peer.target())),
                }
            }
        });

        let failures: Vec<String> = futures::future::join_all(sends)
            .await
            .into_iter()
            .flatten()
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            error!(key = item.key, version = item.version, ?failures, "peer fan-out failed");
            Err(NodeError::ReplicationFailed(failures.join("; ")))
        }
    }

    /// Best-effort re-propagation of the pre-write value, enabled by
    /// `CompensationPolicy::Repropagate`. Results are ignored; peers that
    /// already hold a newer version treat it as a no-op by monotonicity.
    async fn compensate(&self, prior: Option<DataItem>) {
        if self.compensation != CompensationPolicy::Repropagate {
            return;
        }
        let Some(prior) = prior else {
            return;
        };

        warn!(key = prior.key, version = prior.version, "re-propagating pre-write value");
        let notification = UpdateNotification {
            data: prior,
            source_node: self.node_id.clone(),
        };
        let sends = self.peers.iter().map(|peer| {
            let notification = notification.clone();
            async move {
                let _ = tokio::time::timeout(
                    self.fanout_timeout,
                    peer.propagate_update(&notification),
                )
                .await;
            }
        });
        futures::future::join_all(sends).await;
    }
}

impl std::fmt::Debug for EagerReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EagerReplication")
            .field("node_id", &self.node_id)
            .field("peers", &self.peers.len())
            .finish()
    }
}
