use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ReplicationConfig;
use crate::error::{NodeError, NodeResult};
use crate::protocol::{Operation, Transaction, TransactionKind, TransactionResponse};
use crate::replication::EagerReplication;
use crate::rpc::client::NodeTransport;
use crate::storage::DataStore;

/// Per-node transaction routing. All tiers run the same executor; what
/// differs is whether an update role and a downstream forwarding handle are
/// wired in.
pub struct TransactionExecutor {
    node_id: String,
    tier: i32,
    store: Arc<DataStore>,
    /// Next tier's primary, used to forward read-only transactions aimed
    /// below this node.
    downstream: Option<Arc<dyn NodeTransport>>,
    /// Core peers only.
    eager: Option<Arc<EagerReplication>>,
    forward_timeout: Duration,
}

impl TransactionExecutor {
    pub fn new(
        node_id: impl Into<String>,
        tier: i32,
        store: Arc<DataStore>,
        downstream: Option<Arc<dyn NodeTransport>>,
        eager: Option<Arc<EagerReplication>>,
        config: &ReplicationConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            tier,
            store,
            downstream,
            eager,
            forward_timeout: Duration::from_millis(config.fanout_timeout_ms),
        }
    }

    pub async fn execute(&self, txn: &Transaction) -> NodeResult<TransactionResponse> {
        // Writes aimed anywhere below the core are rejected before schema
        // checks, so the caller sees WriteNotAllowed rather than a generic
        // validation error.
        let has_write = txn.operations.iter().any(Operation::is_write);
        if (txn.kind == TransactionKind::Update || has_write) && self.tier != 0 {
            return Err(NodeError::WriteNotAllowed(format!(
                "node {} at tier {} does not accept writes",
                self.node_id, self.tier
            )));
        }

        txn.validate()?;

        match txn.kind {
            TransactionKind::Update => {
                let eager = self.eager.as_ref().ok_or_else(|| {
                    NodeError::Internal(format!("node {} has no update role", self.node_id))
                })?;
                let results = eager.execute_update(txn).await?;
                Ok(TransactionResponse::ok(results))
            }
            TransactionKind::ReadOnly => {
                if txn.target_tier > self.tier {
                    self.forward(txn).await
                } else if txn.target_tier < self.tier {
                    Err(NodeError::WrongTier(format!(
                        "tier-{} data cannot be read from tier {}",
                        txn.target_tier, self.tier
                    )))
                } else {
                    Ok(TransactionResponse::ok(self.read_locally(txn).await))
                }
            }
        }
    }

    /// Forward to the next tier's primary and return its response as-is.
    async fn forward(&self, txn: &Transaction) -> NodeResult<TransactionResponse> {
        let downstream = self.downstream.as_ref().ok_or_else(|| {
            NodeError::WrongTier(format!(
                "node {} cannot forward to tier {}",
                self.node_id, txn.target_tier
            ))
        })?;

        debug!(
            node_id = %self.node_id,
            target_tier = txn.target_tier,
            to = downstream.target(),
            "forwarding read-only transaction"
        );
        tokio::time::timeout(self.forward_timeout, downstream.execute_transaction(txn))
            .await
            .map_err(|_| {
                NodeError::Timeout(format!(
                    "forward to {} timed out",
                    downstream.target()
                ))
            })?
    }

    /// Resolve reads against the local store in operation order; absent
    /// keys contribute nothing.
    async fn read_locally(&self, txn: &Transaction) -> Vec<crate::protocol::DataItem> {
        let mut results = Vec::new();
        for op in &txn.operations {
            if let Operation::Read { key } = *op {
                if let Some(item) = self.store.get(key).await {
                    results.push(item);
                }
            }
        }
        results
    }
}

impl std::fmt::Debug for TransactionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionExecutor")
            .field("node_id", &self.node_id)
            .field("tier", &self.tier)
            .field("has_downstream", &self.downstream.is_some())
            .field("has_eager", &self.eager.is_some())
            .finish()
    }
}
