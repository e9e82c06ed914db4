use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{NodeError, NodeResult};
use crate::protocol::DataItem;

/// One line of `<node_id>_version_history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: i32,
    pub value: i32,
    pub version: i32,
    pub timestamp: i64,
    pub node_id: String,
    pub op: String,
}

impl VersionRecord {
    pub fn update(item: &DataItem, node_id: &str) -> Self {
        Self {
            key: item.key,
            value: item.value,
            version: item.version,
            timestamp: item.timestamp,
            node_id: node_id.to_string(),
            op: "UPDATE".to_string(),
        }
    }

    pub fn item(&self) -> DataItem {
        DataItem {
            key: self.key,
            value: self.value,
            version: self.version,
            timestamp: self.timestamp,
        }
    }
}

/// One line of `<node_id>_data.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DataRecord {
    key: i32,
    value: i32,
    version: i32,
    timestamp: i64,
    node_id: String,
}

struct LogWriters {
    data: BufWriter<File>,
    history: BufWriter<File>,
}

/// Durable append-only log pair for one node: the applied-state log and the
/// version history used for warm-start replay. Every record is flushed
/// before the append returns; the actual file I/O runs on the blocking pool
/// so the RPC loop is never stalled by a disk write.
pub struct VersionLog {
    node_id: String,
    data_path: PathBuf,
    history_path: PathBuf,
    writers: Arc<Mutex<LogWriters>>,
}

impl VersionLog {
    pub fn open(node_id: &str, log_dir: &Path) -> NodeResult<Self> {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            NodeError::Store(format!("failed to create log directory: {}", e))
        })?;

        let data_path = log_dir.join(format!("{}_data.jsonl", node_id));
        let history_path = log_dir.join(format!("{}_version_history.jsonl", node_id));

        let data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| NodeError::Store(format!("failed to open data log: {}", e)))?;
        let history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history_path)
            .map_err(|e| NodeError::Store(format!("failed to open version history: {}", e)))?;

        info!(node_id, dir = %log_dir.display(), "version log opened");
        Ok(Self {
            node_id: node_id.to_string(),
            data_path,
            history_path,
            writers: Arc::new(Mutex::new(LogWriters {
                data: BufWriter::new(data),
                history: BufWriter::new(history),
            })),
        })
    }

    /// Append one applied update to both files and flush. The caller applies
    /// the in-memory update only after this returns Ok.
    pub async fn append(&self, item: &DataItem) -> NodeResult<()> {
        let history_line = serde_json::to_string(&VersionRecord::update(item, &self.node_id))?;
        let data_line = serde_json::to_string(&DataRecord {
            key: item.key,
            value: item.value,
            version: item.version,
            timestamp: item.timestamp,
            node_id: self.node_id.clone(),
        })?;

        let writers = Arc::clone(&self.writers);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut w = writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            writeln!(w.history, "{}", history_line)?;
            w.history.flush()?;
            writeln!(w.data, "{}", data_line)?;
            w.data.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| NodeError::Internal(format!("log writer task failed: {}", e)))??;

        debug!(key = item.key, version = item.version, "logged update");
        Ok(())
    }

    /// Scan the version history in file order. Missing file means a cold
    /// start with no prior state.
    pub fn replay(&self) -> NodeResult<Vec<VersionRecord>> {
        Self::scan_history(&self.history_path)
    }

    pub fn scan_history(history_path: &Path) -> NodeResult<Vec<VersionRecord>> {
        if !history_path.exists() {
            debug!(path = %history_path.display(), "no version history, cold start");
            return Ok(Vec::new());
        }

        let file = File::open(history_path)
            .map_err(|e| NodeError::Store(format!("failed to open version history: {}", e)))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for line in reader.lines() {
            let line =
                line.map_err(|e| NodeError::Store(format!("failed to read history line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: VersionRecord = serde_json::from_str(&line)?;
            records.push(record);
        }
        Ok(records)
    }

    pub async fn close(&self) -> NodeResult<()> {
        let writers = Arc::clone(&self.writers);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut w = writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            w.history.flush()?;
            w.data.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| NodeError::Internal(format!("log writer task failed: {}", e)))??;
        Ok(())
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }
}

impl std::fmt::Debug for VersionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionLog")
            .field("node_id", &self.node_id)
            .field("data_path", &self.data_path)
            .field("history_path", &self.history_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::current_time_secs;
    use tempfile::tempdir;

    fn item(key: i32, value: i32, version: i32) -> DataItem {
        DataItem {
            key,
            value,
            version,
            timestamp: current_time_secs(),
        }
    }

    #[tokio::test]
    async fn append_then_replay_preserves_order() {
        let dir = tempdir().unwrap();
        let log = VersionLog::open("a1", dir.path()).unwrap();

        log.append(&item(0, 10, 1)).await.unwrap();
        log.append(&item(5, 15, 2)).await.unwrap();
        log.append(&item(0, 20, 3)).await.unwrap();

        let records = log.replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(records.iter().all(|r| r.op == "UPDATE" && r.node_id == "a1"));
    }

    #[tokio::test]
    async fn records_are_flushed_per_append() {
        let dir = tempdir().unwrap();
        let log = VersionLog::open("a1", dir.path()).unwrap();
        log.append(&item(1, 1, 1)).await.unwrap();

        // Read the files without closing the log.
        let history = std::fs::read_to_string(log.history_path()).unwrap();
        let data = std::fs::read_to_string(log.data_path()).unwrap();
        assert_eq!(history.lines().count(), 1);
        assert_eq!(data.lines().count(), 1);

        let record: VersionRecord = serde_json::from_str(history.lines().next().unwrap()).unwrap();
        assert_eq!(record.key, 1);
        assert_eq!(record.op, "UPDATE");
    }

    #[test]
    fn cold_start_replays_empty() {
        let dir = tempdir().unwrap();
        let log = VersionLog::open("fresh", dir.path()).unwrap();
        assert!(log.replay().unwrap().is_empty());
    }
}
