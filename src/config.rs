use serde::{Deserialize, Serialize};
use std::env;

/// Full configuration for one node process. Every node in the deployment is
/// launched with its own `Config`; role-specific fields are simply unset for
/// nodes that do not need them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub topology: TopologyConfig,
    pub replication: ReplicationConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier, e.g. "a1", "b2".
    pub node_id: String,
    /// 0 = core, 1 = first tier, 2 = second tier.
    pub tier: i32,
    pub host: String,
    pub port: u16,
    /// Directory for the append-only data and version-history logs.
    pub log_dir: String,
}

/// Who this node talks to. Addresses are `host:port`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Other core peers (core nodes only).
    pub peer_addrs: Vec<String>,
    /// Whether this core node is the designated origin that feeds tier 1.
    pub is_origin: bool,
    /// Whether this tier-1/2 node is its tier's primary.
    pub is_primary: bool,
    /// Tier-1 primary address. On the origin it receives the count-triggered
    /// batches; on any core peer it is the forwarding target for read-only
    /// transactions aimed below the core.
    pub tier1_addr: Option<String>,
    /// Tier-2 primary address (tier-1 primary only).
    pub tier2_addr: Option<String>,
    /// Backup addresses (tier-1/2 primaries only).
    pub backup_addrs: Vec<String>,
}

/// What a peer nack during eager fan-out does beyond failing the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationPolicy {
    /// Surface the error and stop. Reference behaviour.
    FailFast,
    /// Additionally re-propagate the previous value best-effort, ignoring
    /// results.
    Repropagate,
}

/// Payload of each time-triggered sync from tier 1 to tier 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickPayload {
    /// Send the full store every tick. Reference behaviour.
    FullState,
    /// Send only items above the last acknowledged version high-water mark.
    ChangedSinceLastSync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Per-call timeout for all outbound RPCs (ms).
    pub fanout_timeout_ms: u64,
    /// Applied-write count that triggers origin-to-tier-1 sync.
    pub sync_threshold: usize,
    /// Interval of the tier-1-to-tier-2 ticker (ms).
    pub tick_interval_ms: u64,
    /// Grace period for in-flight RPCs at node stop (ms).
    pub shutdown_grace_ms: u64,
    /// Base delay for reconnect backoff (ms).
    pub reconnect_base_delay_ms: u64,
    /// Cap on reconnect backoff delay (ms).
    pub reconnect_max_delay_ms: u64,
    /// Connection attempts before a send fails fast with Unavailable.
    pub reconnect_max_attempts: u32,
    pub compensation: CompensationPolicy,
    pub tick_payload: TickPayload,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            fanout_timeout_ms: 5_000,
            sync_threshold: 10,
            tick_interval_ms: 10_000,
            shutdown_grace_ms: 5_000,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 5_000,
            reconnect_max_attempts: 5,
            compensation: CompensationPolicy::FailFast,
            tick_payload: TickPayload::FullState,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Capacity of the recent-updates ring. Must cover at least one full
    /// count-trigger batch.
    pub recent_ring_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recent_ring_capacity: 128,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let node = NodeConfig {
            node_id: env::var("NODE_ID").unwrap_or_else(|_| "a1".to_string()),
            tier: env::var("NODE_TIER")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            host: env::var("NODE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("NODE_PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5000),
            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "data/logs".to_string()),
        };

        let topology = TopologyConfig {
            peer_addrs: split_addrs(env::var("PEER_ADDRS").unwrap_or_default()),
            is_origin: env_flag("IS_ORIGIN"),
            is_primary: env_flag("IS_PRIMARY"),
            tier1_addr: env::var("TIER1_ADDR").ok().filter(|s| !s.is_empty()),
            tier2_addr: env::var("TIER2_ADDR").ok().filter(|s| !s.is_empty()),
            backup_addrs: split_addrs(env::var("BACKUP_ADDRS").unwrap_or_default()),
        };

        let mut replication = ReplicationConfig::default();
        if let Ok(v) = env::var("FANOUT_TIMEOUT_MS") {
            replication.fanout_timeout_ms = v.parse().unwrap_or(replication.fanout_timeout_ms);
        }
        if let Ok(v) = env::var("SYNC_THRESHOLD") {
            replication.sync_threshold = v.parse().unwrap_or(replication.sync_threshold);
        }
        if let Ok(v) = env::var("TICK_INTERVAL_MS") {
            replication.tick_interval_ms = v.parse().unwrap_or(replication.tick_interval_ms);
        }
        if let Ok(v) = env::var("COMPENSATION_POLICY") {
            replication.compensation = match v.to_lowercase().as_str() {
                "repropagate" => CompensationPolicy::Repropagate,
                _ => CompensationPolicy::FailFast,
            };
        }
        if let Ok(v) = env::var("TICK_PAYLOAD") {
            replication.tick_payload = match v.to_lowercase().as_str() {
                "changed" | "changed_since_last_sync" => TickPayload::ChangedSinceLastSync,
                _ => TickPayload::FullState,
            };
        }

        Ok(Self {
            node,
            topology,
            replication,
            storage: StorageConfig::default(),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }
}

fn split_addrs(raw: String) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
