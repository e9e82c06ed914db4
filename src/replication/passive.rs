use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::error::{NodeError, NodeResult};
use crate::protocol::{UpdateGroup, UpdateNotification};
use crate::rpc::client::NodeTransport;
use crate::storage::DataStore;

/// Primary-backup replication role for tiers 1 and 2. The primary applies
/// incoming batches from its upstream source and fans each applied item out
/// to its backups; backups never take sync batches directly.
pub struct PassiveReplication {
    node_id: String,
    tier: i32,
    is_primary: bool,
    store: Arc<DataStore>,
    backups: Vec<Arc<dyn NodeTransport>>,
    fanout_timeout: Duration,
}

impl PassiveReplication {
    pub fn new(
        node_id: impl Into<String>,
        tier: i32,
        is_primary: bool,
        store: Arc<DataStore>,
        backups: Vec<Arc<dyn NodeTransport>>,
        config: &ReplicationConfig,
    ) -> Self {
        let node_id = node_id.into();
        info!(
            %node_id,
            tier,
            is_primary,
            backups = backups.len(),
            "passive replication role initialized"
        );
        Self {
            node_id,
            tier,
            is_primary,
            store,
            backups,
            fanout_timeout: Duration::from_millis(config.fanout_timeout_ms),
        }
    }

    /// Handle a sync batch from the upstream tier. Items are applied in
    /// batch order; stale items are monotone no-ops. Applied items are then
    /// fanned out to the backups one at a time, and the overall result is
    /// success only if every backup acknowledged every item. Local state is
    /// kept either way; the next sync reconciles a lagging backup.
    pub async fn handle_sync(&self, group: &UpdateGroup) -> NodeResult<()> {
        if !self.is_primary {
            return Err(NodeError::WrongTier(format!(
                "{} is a backup; it only accepts propagation from its primary",
                self.node_id
            )));
        }
        let expected_source = self.tier - 1;
        if group.source_tier != expected_source {
            return Err(NodeError::WrongTier(format!(
                "sync from tier {} rejected; expected tier {}",
                group.source_tier, expected_source
            )));
        }

        debug!(
            from = %group.source_node,
            items = group.items.len(),
            "applying sync batch"
        );

        let mut applied = Vec::new();
        for item in &group.items {
            let prior = self.store.get(item.key).await;
            // Items carry the timestamp assigned where the write
            // originated, so every replica resolves a version tie the same
            // way.
            let stored = self.store.apply(*item).await?;
            let took_effect = prior.map_or(true, |p| stored.supersedes(&p));
            if took_effect {
                applied.push(stored);
            }
        }

        let mut failures = Vec::new();
        for item in &applied {
            let notification = UpdateNotification {
                data: *item,
                source_node: self.node_id.clone(),
            };
            let sends = self.backups.iter().map(|backup| {
                let notification = notification.clone();
                async move {
                    let outcome = tokio::time::timeout(
                        self.fanout_timeout,
                        backup.propagate_update(&notification),
                    )
                    .await;
                    match outcome {
                        Ok(Ok(ack)) if ack.success => None,
                        Ok(Ok(ack)) => {
                            Some(format!("{} nacked: {}", backup.target(), ack.message))
                        }
                        Ok(Err(e)) => Some(format!("{} failed: {}", backup.target(), e)),
                        Err(_) => Some(format!("{} timed out", backup.target())),
                    }
                }
            });
            failures.extend(
                futures::future::join_all(sends)
                    .await
                    .into_iter()
                    .flatten(),
            );
        }

        if failures.is_empty() {
            debug!(applied = applied.len(), "sync batch applied and fanned out");
            Ok(())
        } else {
            warn!(?failures, "backup fan-out incomplete; keeping local state");
            Err(NodeError::ReplicationFailed(failures.join("; ")))
        }
    }
}

impl std::fmt::Debug for PassiveReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveReplication")
            .field("node_id", &self.node_id)
            .field("tier", &self.tier)
            .field("is_primary", &self.is_primary)
            .field("backups", &self.backups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        AckResponse, DataItem, NodeStatus, Transaction, TransactionResponse,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingBackup {
        label: String,
        nack: AtomicBool,
        seen: AsyncMutex<Vec<DataItem>>,
    }

    impl RecordingBackup {
        fn new(label: &str) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                nack: AtomicBool::new(false),
                seen: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NodeTransport for RecordingBackup {
        fn target(&self) -> &str {
            &self.label
        }

        async fn execute_transaction(
            &self,
            _txn: &Transaction,
        ) -> NodeResult<TransactionResponse> {
            Ok(TransactionResponse::ok(Vec::new()))
        }

        async fn propagate_update(
            &self,
            notification: &UpdateNotification,
        ) -> NodeResult<AckResponse> {
            self.seen.lock().await.push(notification.data);
            if self.nack.load(Ordering::SeqCst) {
                Ok(AckResponse::failed("injected failure"))
            } else {
                Ok(AckResponse::ok(""))
            }
        }

        async fn sync_updates(&self, _group: &UpdateGroup) -> NodeResult<AckResponse> {
            Ok(AckResponse::ok(""))
        }

        async fn node_status(&self) -> NodeResult<NodeStatus> {
            Ok(NodeStatus {
                node_id: self.label.clone(),
                tier: 1,
                current_data: Vec::new(),
            })
        }
    }

    fn group(items: Vec<DataItem>, source_tier: i32) -> UpdateGroup {
        UpdateGroup {
            count: items.len() as i32,
            items,
            source_node: "upstream".to_string(),
            source_tier,
        }
    }

    fn item(key: i32, value: i32, version: i32) -> DataItem {
        DataItem {
            key,
            value,
            version,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn applies_batch_in_order_and_fans_out_to_backups() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DataStore::open("b1", dir.path(), 128).unwrap());
        let backup = RecordingBackup::new("b2");
        let role = PassiveReplication::new(
            "b1",
            1,
            true,
            Arc::clone(&store),
            vec![backup.clone() as Arc<dyn NodeTransport>],
            &ReplicationConfig::default(),
        );

        role.handle_sync(&group(
            vec![item(0, 100, 1), item(1, 100, 2), item(0, 101, 3)],
            0,
        ))
        .await
        .unwrap();

        assert_eq!(store.get(0).await.unwrap().value, 101);
        assert_eq!(store.get(1).await.unwrap().value, 100);

        let seen = backup.seen.lock().await;
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen.iter().map(|i| i.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn stale_items_are_ignored_and_not_fanned_out() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DataStore::open("b1", dir.path(), 128).unwrap());
        let backup = RecordingBackup::new("b2");
        let role = PassiveReplication::new(
            "b1",
            1,
            true,
            Arc::clone(&store),
            vec![backup.clone() as Arc<dyn NodeTransport>],
            &ReplicationConfig::default(),
        );

        role.handle_sync(&group(vec![item(7, 2, 5)], 0)).await.unwrap();
        role.handle_sync(&group(vec![item(7, 1, 3)], 0)).await.unwrap();

        assert_eq!(store.get(7).await.unwrap().version, 5);
        assert_eq!(backup.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn backup_failure_keeps_local_state_and_reports_error() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DataStore::open("b1", dir.path(), 128).unwrap());
        let backup = RecordingBackup::new("b2");
        backup.nack.store(true, Ordering::SeqCst);
        let role = PassiveReplication::new(
            "b1",
            1,
            true,
            Arc::clone(&store),
            vec![backup.clone() as Arc<dyn NodeTransport>],
            &ReplicationConfig::default(),
        );

        let err = role
            .handle_sync(&group(vec![item(0, 100, 1)], 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ReplicationFailed");
        assert_eq!(store.get(0).await.unwrap().value, 100);
    }

    #[tokio::test]
    async fn backup_rejects_sync_batches() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DataStore::open("b2", dir.path(), 128).unwrap());
        let role = PassiveReplication::new(
            "b2",
            1,
            false,
            Arc::clone(&store),
            Vec::new(),
            &ReplicationConfig::default(),
        );

        let err = role
            .handle_sync(&group(vec![item(0, 1, 1)], 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "WrongTier");
        assert!(store.get(0).await.is_none());
    }

    #[tokio::test]
    async fn rejects_sync_from_the_wrong_tier() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DataStore::open("c1", dir.path(), 128).unwrap());
        let role = PassiveReplication::new(
            "c1",
            2,
            true,
            Arc::clone(&store),
            Vec::new(),
            &ReplicationConfig::default(),
        );

        // Tier 2 accepts only tier-1 batches.
        let err = role
            .handle_sync(&group(vec![item(0, 1, 1)], 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "WrongTier");
    }
}
