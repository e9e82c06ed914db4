use std::fmt;

/// Error taxonomy for the replication engine. Each variant carries a stable
/// kind string that prefixes `error_message` on the wire so callers can match
/// on it without parsing free text.
#[derive(Debug)]
pub enum NodeError {
    /// Malformed transaction string or schema.
    InvalidTransaction(String),
    /// Write submitted to a non-core node.
    WriteNotAllowed(String),
    /// Read-only transaction that can neither be served here nor forwarded
    /// downward.
    WrongTier(String),
    /// One or more peers/backups did not acknowledge within the timeout.
    ReplicationFailed(String),
    /// Invalid store argument, monotonicity violation, or log I/O failure.
    Store(String),
    /// Connection to a required downstream peer could not be (re)established.
    Unavailable(String),
    Timeout(String),
    Serialization(String),
    Internal(String),
}

impl NodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::InvalidTransaction(_) => "InvalidTransaction",
            NodeError::WriteNotAllowed(_) => "WriteNotAllowed",
            NodeError::WrongTier(_) => "WrongTier",
            NodeError::ReplicationFailed(_) => "ReplicationFailed",
            NodeError::Store(_) => "StoreError",
            NodeError::Unavailable(_) => "Unavailable",
            NodeError::Timeout(_) => "Timeout",
            NodeError::Serialization(_) => "SerializationError",
            NodeError::Internal(_) => "Internal",
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidTransaction(msg)
            | NodeError::WriteNotAllowed(msg)
            | NodeError::WrongTier(msg)
            | NodeError::ReplicationFailed(msg)
            | NodeError::Store(msg)
            | NodeError::Unavailable(msg)
            | NodeError::Timeout(msg)
            | NodeError::Serialization(msg)
            | NodeError::Internal(msg) => write!(f, "{}: {}", self.kind(), msg),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Store(format!("log I/O failure: {}", err))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NodeError::Timeout(err.to_string())
        } else {
            NodeError::Unavailable(err.to_string())
        }
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        NodeError::Internal(err.to_string())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
