use std::sync::Arc;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};

use crate::node::Node;
use crate::protocol::{
    AckResponse, NodeStatus, Transaction, TransactionResponse, UpdateGroup, UpdateNotification,
};

/// The RPC surface every node serves. Transaction and replication outcomes
/// are reported in-band (`success: false` with a message) rather than as
/// transport errors; only malformed requests surface as HTTP errors.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/rpc/transaction", post(execute_transaction_handler))
        .route("/rpc/propagate", post(propagate_update_handler))
        .route("/rpc/sync", post(sync_updates_handler))
        .route("/rpc/status", get(node_status_handler))
        .with_state(node)
}

async fn execute_transaction_handler(
    State(node): State<Arc<Node>>,
    Json(txn): Json<Transaction>,
) -> Json<TransactionResponse> {
    Json(node.execute_transaction(txn).await)
}

async fn propagate_update_handler(
    State(node): State<Arc<Node>>,
    Json(notification): Json<UpdateNotification>,
) -> Json<AckResponse> {
    Json(node.propagate_update(notification).await)
}

async fn sync_updates_handler(
    State(node): State<Arc<Node>>,
    Json(group): Json<UpdateGroup>,
) -> Json<AckResponse> {
    Json(node.sync_updates(group).await)
}

async fn node_status_handler(State(node): State<Arc<Node>>) -> Json<NodeStatus> {
    Json(node.status().await)
}
