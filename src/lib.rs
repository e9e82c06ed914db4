// cascade-kv - three-tier hierarchically replicated key-value store

// Wire messages and data model
pub mod protocol;

// Per-node versioned store and durable version log
pub mod storage;

// Transaction parsing and per-node routing
pub mod transaction;

// Replication roles and inter-tier triggers
pub mod replication;

// RPC surface and outbound peer handles
pub mod rpc;

// Node identity, wiring, and lifecycle
pub mod node;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use error::{NodeError, NodeResult};
pub use node::Node;
