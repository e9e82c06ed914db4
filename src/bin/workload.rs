// Line-oriented workload client: reads transaction strings from stdin,
// submits each to the node named by TARGET_ADDR, and prints one JSON
// response per line.

use std::io::BufRead;

use cascade_kv::protocol::TransactionResponse;
use cascade_kv::transaction::parse_line;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let target = std::env::var("TARGET_ADDR").unwrap_or_else(|_| "127.0.0.1:5000".to_string());
    let url = format!("http://{}/rpc/transaction", target);
    let client = reqwest::Client::new();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok(txn) => {
                let response: TransactionResponse =
                    client.post(&url).json(&txn).send().await?.json().await?;
                println!("{}", serde_json::to_string(&response)?);
            }
            Err(e) => {
                println!(
                    "{}",
                    serde_json::json!({ "success": false, "error_message": e.to_string() })
                );
            }
        }
    }

    Ok(())
}
