use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{NodeError, NodeResult};
use crate::protocol::{
    AckResponse, DataItem, NodeStatus, Transaction, TransactionResponse, UpdateGroup,
    UpdateNotification,
};
use crate::replication::{EagerReplication, OriginSync, PassiveReplication, TierSync};
use crate::rpc::client::{NodeTransport, PeerHandle};
use crate::rpc::server;
use crate::storage::DataStore;
use crate::transaction::TransactionExecutor;

struct RuntimeState {
    local_addr: Option<SocketAddr>,
    server: Option<JoinHandle<std::io::Result<()>>>,
    origin_actor: Option<JoinHandle<()>>,
    tier_sync: Option<TierSync>,
    origin_rx: Option<mpsc::Receiver<DataItem>>,
}

/// One replicated-store node: a versioned store, a transaction executor, a
/// tier-specific replication role, and the RPC surface. Lifecycle is
/// `Start -> Ready -> Serving -> Stop`; the ready signal fires once the
/// listener is bound and outbound connections have been attempted.
pub struct Node {
    config: Config,
    store: Arc<DataStore>,
    executor: TransactionExecutor,
    passive: Option<Arc<PassiveReplication>>,
    /// All outbound handles, kept concretely for connection priming.
    handles: Vec<Arc<PeerHandle>>,
    downstream: Option<Arc<PeerHandle>>,
    shutdown: watch::Sender<bool>,
    ready: watch::Sender<bool>,
    runtime: Mutex<RuntimeState>,
}

impl Node {
    pub fn new(config: Config) -> NodeResult<Arc<Self>> {
        let node_id = config.node.node_id.clone();
        let tier = config.node.tier;
        let store = Arc::new(DataStore::open(
            &node_id,
            Path::new(&config.node.log_dir),
            config.storage.recent_ring_capacity,
        )?);

        let mut handles = Vec::new();

        let peers: Vec<Arc<PeerHandle>> = config
            .topology
            .peer_addrs
            .iter()
            .map(|addr| PeerHandle::new(addr.clone(), &config.replication).map(Arc::new))
            .collect::<NodeResult<_>>()?;
        handles.extend(peers.iter().cloned());

        let downstream_addr = match tier {
            0 => config.topology.tier1_addr.clone(),
            1 if config.topology.is_primary => config.topology.tier2_addr.clone(),
            _ => None,
        };
        let downstream = downstream_addr
            .map(|addr| PeerHandle::new(addr, &config.replication).map(Arc::new))
            .transpose()?;
        if let Some(handle) = &downstream {
            handles.push(Arc::clone(handle));
        }

        let backups: Vec<Arc<PeerHandle>> = config
            .topology
            .backup_addrs
            .iter()
            .map(|addr| PeerHandle::new(addr.clone(), &config.replication).map(Arc::new))
            .collect::<NodeResult<_>>()?;
        handles.extend(backups.iter().cloned());

        // The origin feeds its count trigger through a channel owned by an
        // actor spawned at start.
        let mut origin_rx = None;
        let applied_tx = if tier == 0 && config.topology.is_origin {
            let (tx, rx) = mpsc::channel(256);
            origin_rx = Some(rx);
            Some(tx)
        } else {
            None
        };

        let eager = if tier == 0 {
            Some(Arc::new(EagerReplication::new(
                node_id.clone(),
                Arc::clone(&store),
                peers
                    .iter()
                    .map(|p| Arc::clone(p) as Arc<dyn NodeTransport>)
                    .collect(),
                &config.replication,
                applied_tx,
            )))
        } else {
            None
        };

        let passive = if tier > 0 {
            Some(Arc::new(PassiveReplication::new(
                node_id.clone(),
                tier,
                config.topology.is_primary,
                Arc::clone(&store),
                backups
                    .iter()
                    .map(|b| Arc::clone(b) as Arc<dyn NodeTransport>)
                    .collect(),
                &config.replication,
            )))
        } else {
            None
        };

        let executor = TransactionExecutor::new(
            node_id.clone(),
            tier,
            Arc::clone(&store),
            downstream
                .as_ref()
                .map(|d| Arc::clone(d) as Arc<dyn NodeTransport>),
            eager,
            &config.replication,
        );

        let (shutdown, _) = watch::channel(false);
        let (ready, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            executor,
            passive,
            handles,
            downstream,
            shutdown,
            ready,
            runtime: Mutex::new(RuntimeState {
                local_addr: None,
                server: None,
                origin_actor: None,
                tier_sync: None,
                origin_rx,
            }),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    pub fn tier(&self) -> i32 {
        self.config.node.tier
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Resolves to `true` once the node is serving.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.local_addr
    }

    /// Bind the listener, start serving, attempt outbound connections, and
    /// spawn the role-specific background tasks.
    pub async fn start(self: &Arc<Self>) -> NodeResult<SocketAddr> {
        let mut runtime = self.runtime.lock().await;
        if runtime.server.is_some() {
            return Err(NodeError::Internal(format!(
                "node {} already started",
                self.node_id()
            )));
        }

        let listener = TcpListener::bind(self.config.listen_addr())
            .await
            .map_err(|e| {
                NodeError::Unavailable(format!(
                    "failed to bind {}: {}",
                    self.config.listen_addr(),
                    e
                ))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NodeError::Internal(e.to_string()))?;

        let app = server::router(Arc::clone(self)).layer(CorsLayer::permissive());
        let mut shutdown_rx = self.shutdown.subscribe();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        });

        // Attempt outbound connections once; handles reconnect lazily on
        // use, so failures here only delay the first send.
        futures::future::join_all(self.handles.iter().map(|h| h.prime())).await;

        if let Some(rx) = runtime.origin_rx.take() {
            if let Some(downstream) = &self.downstream {
                runtime.origin_actor = Some(OriginSync::spawn(
                    self.node_id().to_string(),
                    Arc::clone(&self.store),
                    Arc::clone(downstream) as Arc<dyn NodeTransport>,
                    self.config.replication.sync_threshold,
                    Duration::from_millis(self.config.replication.fanout_timeout_ms),
                    rx,
                    self.shutdown.subscribe(),
                ));
            } else {
                warn!(
                    node_id = %self.node_id(),
                    "origin flag set without a tier-1 address; count trigger disabled"
                );
            }
        }

        if self.tier() == 1 && self.config.topology.is_primary {
            if let Some(downstream) = &self.downstream {
                runtime.tier_sync = Some(TierSync::spawn(
                    self.node_id().to_string(),
                    self.tier(),
                    Arc::clone(&self.store),
                    Arc::clone(downstream) as Arc<dyn NodeTransport>,
                    Duration::from_millis(self.config.replication.tick_interval_ms),
                    self.config.replication.tick_payload,
                    Duration::from_millis(self.config.replication.fanout_timeout_ms),
                ));
            }
        }

        runtime.local_addr = Some(local_addr);
        runtime.server = Some(server);
        let _ = self.ready.send(true);

        info!(
            node_id = %self.node_id(),
            tier = self.tier(),
            addr = %local_addr,
            "node serving"
        );
        Ok(local_addr)
    }

    /// Cancel background tasks, await them, then shut the server down with a
    /// grace period for in-flight RPCs.
    pub async fn stop(&self) -> NodeResult<()> {
        let mut runtime = self.runtime.lock().await;

        if let Some(tier_sync) = runtime.tier_sync.take() {
            tier_sync.stop().await;
        }

        let _ = self.shutdown.send(true);

        if let Some(actor) = runtime.origin_actor.take() {
            let _ = actor.await;
        }

        if let Some(server) = runtime.server.take() {
            let grace = Duration::from_millis(self.config.replication.shutdown_grace_ms);
            let abort = server.abort_handle();
            match tokio::time::timeout(grace, server).await {
                Ok(joined) => {
                    if let Ok(Err(e)) = joined {
                        warn!(node_id = %self.node_id(), "server exited with error: {}", e);
                    }
                }
                Err(_) => {
                    warn!(
                        node_id = %self.node_id(),
                        "server did not drain within the grace period"
                    );
                    abort.abort();
                }
            }
        }

        runtime.local_addr = None;
        self.store.close().await?;
        info!(node_id = %self.node_id(), "node stopped");
        Ok(())
    }

    /// `ExecuteTransaction`: every outcome is reported in-band.
    pub async fn execute_transaction(&self, txn: Transaction) -> TransactionResponse {
        let txn_id = uuid::Uuid::new_v4();
        debug!(
            node_id = %self.node_id(),
            %txn_id,
            ops = txn.operations.len(),
            target_tier = txn.target_tier,
            "executing transaction"
        );
        match self.executor.execute(&txn).await {
            Ok(response) => response,
            Err(e) => {
                warn!(node_id = %self.node_id(), %txn_id, "transaction failed: {}", e);
                TransactionResponse::failed(&e)
            }
        }
    }

    /// `PropagateUpdate`: apply the peer's item under the monotone rule,
    /// keeping the timestamp it was stamped with at its origin.
    pub async fn propagate_update(&self, notification: UpdateNotification) -> AckResponse {
        let item = notification.data;
        match self.store.apply(item).await {
            Ok(_) => AckResponse::ok(format!("update processed for key {}", item.key)),
            Err(e) => {
                warn!(
                    node_id = %self.node_id(),
                    from = %notification.source_node,
                    "failed to apply propagated update: {}",
                    e
                );
                AckResponse::failed(e.to_string())
            }
        }
    }

    /// `SyncUpdates`: only tier-1/2 primaries take sync batches.
    pub async fn sync_updates(&self, group: UpdateGroup) -> AckResponse {
        let Some(passive) = &self.passive else {
            let e = NodeError::WrongTier(format!(
                "core node {} accepts no sync batches",
                self.node_id()
            ));
            return AckResponse::failed(e.to_string());
        };
        match passive.handle_sync(&group).await {
            Ok(()) => AckResponse::ok(format!("applied {} items", group.items.len())),
            Err(e) => AckResponse::failed(e.to_string()),
        }
    }

    /// `GetNodeStatus`.
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id().to_string(),
            tier: self.tier(),
            current_data: self.store.get_all().await,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.config.node.node_id)
            .field("tier", &self.config.node.tier)
            .finish()
    }
}
