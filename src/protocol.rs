// Wire messages exchanged between nodes and clients. JSON-serialized over
// the node RPC surface; shapes follow the replication IDL.

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// Seconds since the Unix epoch.
pub fn current_time_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The atomic unit of replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub key: i32,
    pub value: i32,
    pub version: i32,
    pub timestamp: i64,
}

impl DataItem {
    /// Conflict ordering: `(version, timestamp)` with version dominant.
    pub fn supersedes(&self, other: &DataItem) -> bool {
        (self.version, self.timestamp) > (other.version, other.timestamp)
    }
}

/// A single transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Read { key: i32 },
    Write { key: i32, value: i32 },
}

impl Operation {
    pub fn is_write(&self) -> bool {
        matches!(self, Operation::Write { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    ReadOnly,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub target_tier: i32,
    pub operations: Vec<Operation>,
}

impl Transaction {
    /// Schema-level checks, independent of which node is executing.
    pub fn validate(&self) -> NodeResult<()> {
        if !(0..=2).contains(&self.target_tier) {
            return Err(NodeError::InvalidTransaction(format!(
                "target tier {} out of range",
                self.target_tier
            )));
        }
        match self.kind {
            TransactionKind::Update => {
                if self.target_tier != 0 {
                    return Err(NodeError::InvalidTransaction(
                        "update transactions must target tier 0".to_string(),
                    ));
                }
            }
            TransactionKind::ReadOnly => {
                if self.operations.iter().any(Operation::is_write) {
                    return Err(NodeError::InvalidTransaction(
                        "read-only transaction contains a write".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Single-item eager propagation between peers of one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNotification {
    pub data: DataItem,
    pub source_node: String,
}

/// Ordered batch handed between tiers by the count and time triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateGroup {
    pub items: Vec<DataItem>,
    pub source_node: String,
    pub source_tier: i32,
    pub count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<DataItem>,
    #[serde(default)]
    pub error_message: String,
}

impl TransactionResponse {
    pub fn ok(results: Vec<DataItem>) -> Self {
        Self {
            success: true,
            results,
            error_message: String::new(),
        }
    }

    pub fn failed(err: &NodeError) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            error_message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl AckResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub tier: i32,
    pub current_data: Vec<DataItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_must_target_core() {
        let txn = Transaction {
            kind: TransactionKind::Update,
            target_tier: 1,
            operations: vec![Operation::Write { key: 1, value: 2 }],
        };
        assert!(txn.validate().is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let txn = Transaction {
            kind: TransactionKind::ReadOnly,
            target_tier: 2,
            operations: vec![
                Operation::Read { key: 1 },
                Operation::Write { key: 1, value: 2 },
            ],
        };
        let err = txn.validate().unwrap_err();
        assert_eq!(err.kind(), "InvalidTransaction");
    }

    #[test]
    fn version_dominates_timestamp() {
        let older_but_newer_version = DataItem {
            key: 7,
            value: 1,
            version: 3,
            timestamp: 100,
        };
        let newer_but_older_version = DataItem {
            key: 7,
            value: 2,
            version: 2,
            timestamp: 200,
        };
        assert!(older_but_newer_version.supersedes(&newer_but_older_version));
        assert!(!newer_but_older_version.supersedes(&older_but_newer_version));
    }
}
