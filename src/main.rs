// cascade-kv node process - one replicated-store node per process

use cascade_kv::{config::Config, node::Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;

    // Build and start the node
    let node = Node::new(config)?;
    let addr = node.start().await?;
    println!(
        "node {} (tier {}) serving on http://{}",
        node.node_id(),
        node.tier(),
        addr
    );
    println!("  POST /rpc/transaction - execute a transaction");
    println!("  POST /rpc/propagate   - apply a peer update");
    println!("  POST /rpc/sync        - apply an inter-tier batch");
    println!("  GET  /rpc/status      - node id, tier, current data");

    tokio::signal::ctrl_c().await?;
    node.stop().await?;

    Ok(())
}
