use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ReplicationConfig;
use crate::error::{NodeError, NodeResult};
use crate::protocol::{
    AckResponse, NodeStatus, Transaction, TransactionResponse, UpdateGroup, UpdateNotification,
};

/// The four RPCs every node serves. Outbound peer handles implement this
/// over HTTP; tests substitute in-memory impls.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Address or label for logs.
    fn target(&self) -> &str;

    async fn execute_transaction(&self, txn: &Transaction) -> NodeResult<TransactionResponse>;
    async fn propagate_update(&self, notification: &UpdateNotification)
        -> NodeResult<AckResponse>;
    async fn sync_updates(&self, group: &UpdateGroup) -> NodeResult<AckResponse>;
    async fn node_status(&self) -> NodeResult<NodeStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outbound handle to one peer. Connections are established lazily: a send
/// from `Disconnected` first probes the peer's status endpoint with bounded
/// exponential backoff, and fails fast with `Unavailable` once the attempts
/// are exhausted. A transport-level send failure drops the handle back to
/// `Disconnected` so the next send reconnects.
pub struct PeerHandle {
    addr: String,
    base_url: String,
    client: reqwest::Client,
    state: Mutex<ConnState>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl PeerHandle {
    pub fn new(addr: impl Into<String>, config: &ReplicationConfig) -> NodeResult<Self> {
        let addr = addr.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.fanout_timeout_ms))
            .build()
            .map_err(|e| NodeError::Internal(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            base_url: format!("http://{}", addr),
            addr,
            client,
            state: Mutex::new(ConnState::Disconnected),
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.reconnect_max_attempts,
        })
    }

    /// Attempt a single connection probe, ignoring failure. Used at node
    /// start so the ready signal fires after connections were attempted.
    pub async fn prime(&self) {
        let mut state = self.state.lock().await;
        if *state == ConnState::Connected {
            return;
        }
        *state = ConnState::Connecting;
        match self.probe().await {
            Ok(()) => *state = ConnState::Connected,
            Err(e) => {
                debug!(peer = %self.addr, "initial connection attempt failed: {}", e);
                *state = ConnState::Disconnected;
            }
        }
    }

    async fn probe(&self) -> NodeResult<()> {
        let resp = self
            .client
            .get(format!("{}/rpc/status", self.base_url))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NodeError::Unavailable(format!(
                "peer {} returned {}",
                self.addr,
                resp.status()
            )))
        }
    }

    async fn ensure_connected(&self) -> NodeResult<()> {
        let mut state = self.state.lock().await;
        if *state == ConnState::Connected {
            return Ok(());
        }

        *state = ConnState::Connecting;
        for attempt in 0..self.max_attempts {
            match self.probe().await {
                Ok(()) => {
                    debug!(peer = %self.addr, "connected");
                    *state = ConnState::Connected;
                    return Ok(());
                }
                Err(e) => {
                    let exp = self
                        .base_delay
                        .saturating_mul(1u32 << attempt.min(16))
                        .min(self.max_delay);
                    let jitter = {
                        use rand::Rng;
                        let cap = (exp.as_millis() as u64 / 4).max(1);
                        Duration::from_millis(rand::rng().random_range(0..cap))
                    };
                    debug!(
                        peer = %self.addr,
                        attempt,
                        "connection attempt failed ({}), backing off {:?}",
                        e,
                        exp + jitter
                    );
                    tokio::time::sleep(exp + jitter).await;
                }
            }
        }

        *state = ConnState::Disconnected;
        Err(NodeError::Unavailable(format!(
            "peer {} unreachable after {} attempts",
            self.addr, self.max_attempts
        )))
    }

    async fn mark_disconnected(&self) {
        *self.state.lock().await = ConnState::Disconnected;
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> NodeResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.ensure_connected().await?;

        let url = format!("{}{}", self.base_url, path);
        let sent = self.client.post(&url).json(body).send().await;
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                warn!(peer = %self.addr, "send failed: {}", e);
                self.mark_disconnected().await;
                return Err(e.into());
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(NodeError::Internal(format!(
                "peer {} rejected {}: {} {}",
                self.addr, path, status, body
            )));
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| NodeError::Serialization(format!("bad response from {}: {}", self.addr, e)))
    }
}

#[async_trait]
impl NodeTransport for PeerHandle {
    fn target(&self) -> &str {
        &self.addr
    }

    async fn execute_transaction(&self, txn: &Transaction) -> NodeResult<TransactionResponse> {
        self.post("/rpc/transaction", txn).await
    }

    async fn propagate_update(
        &self,
        notification: &UpdateNotification,
    ) -> NodeResult<AckResponse> {
        self.post("/rpc/propagate", notification).await
    }

    async fn sync_updates(&self, group: &UpdateGroup) -> NodeResult<AckResponse> {
        self.post("/rpc/sync", group).await
    }

    async fn node_status(&self) -> NodeResult<NodeStatus> {
        self.ensure_connected().await?;
        let url = format!("{}/rpc/status", self.base_url);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_disconnected().await;
                return Err(e.into());
            }
        };
        resp.json::<NodeStatus>()
            .await
            .map_err(|e| NodeError::Serialization(format!("bad status from {}: {}", self.addr, e)))
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle").field("addr", &self.addr).finish()
    }
}
