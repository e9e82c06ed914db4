use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::protocol::{current_time_secs, DataItem};
use crate::storage::version_log::VersionLog;

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreStats {
    pub keys: usize,
    pub updates_applied: u64,
    pub updates_ignored: u64,
    pub next_version: i32,
}

struct StoreInner {
    /// Key order is the iteration order handed to GetAll, which the tier-2
    /// sync relies on for a deterministic payload.
    data: BTreeMap<i32, DataItem>,
    /// Last applied updates in apply order, bounded.
    recent: VecDeque<DataItem>,
    next_version: i32,
    applied: u64,
    ignored: u64,
}

impl StoreInner {
    fn push_recent(&mut self, item: DataItem, capacity: usize) {
        if self.recent.len() == capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(item);
    }
}

/// Per-node versioned store. For every key the stored version never
/// decreases: an update is applied iff it strictly supersedes what is
/// present under the `(version, timestamp)` ordering, and it reaches memory
/// only after the durable log append has returned.
pub struct DataStore {
    node_id: String,
    ring_capacity: usize,
    inner: Mutex<StoreInner>,
    log: VersionLog,
}

impl DataStore {
    /// Open the store, replaying any existing version history under the
    /// monotone rule. `next_version` resumes one past the highest version
    /// seen in the log.
    pub fn open(node_id: &str, log_dir: &Path, ring_capacity: usize) -> NodeResult<Self> {
        let log = VersionLog::open(node_id, log_dir)?;
        let records = log.replay()?;

        let mut inner = StoreInner {
            data: BTreeMap::new(),
            recent: VecDeque::with_capacity(ring_capacity),
            next_version: 1,
            applied: 0,
            ignored: 0,
        };

        let replayed = records.len();
        for record in records {
            let item = record.item();
            inner.next_version = inner.next_version.max(item.version + 1);
            match inner.data.get(&item.key) {
                Some(existing) if !item.supersedes(existing) => continue,
                _ => {
                    inner.data.insert(item.key, item);
                    inner.push_recent(item, ring_capacity);
                }
            }
        }

        if replayed > 0 {
            info!(
                node_id,
                replayed,
                keys = inner.data.len(),
                next_version = inner.next_version,
                "store rebuilt from version history"
            );
        }

        Ok(Self {
            node_id: node_id.to_string(),
            ring_capacity,
            inner: Mutex::new(inner),
            log,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn get(&self, key: i32) -> Option<DataItem> {
        self.inner.lock().await.data.get(&key).copied()
    }

    /// All items in key order.
    pub async fn get_all(&self) -> Vec<DataItem> {
        self.inner.lock().await.data.values().copied().collect()
    }

    /// The last `n` applied updates, oldest first.
    pub async fn recent_updates(&self, n: usize) -> Vec<DataItem> {
        let inner = self.inner.lock().await;
        let skip = inner.recent.len().saturating_sub(n);
        inner.recent.iter().skip(skip).copied().collect()
    }

    /// Apply a locally originated update: the item is stamped with the
    /// current wall clock here, where the write originated.
    pub async fn update(&self, key: i32, value: i32, version: i32) -> NodeResult<DataItem> {
        self.apply(DataItem {
            key,
            value,
            version,
            timestamp: current_time_secs(),
        })
        .await
    }

    /// Apply an item under the `(version, timestamp)` ordering, version
    /// dominant: the item is stored iff it strictly supersedes what is
    /// present. The timestamp is the one assigned where the write
    /// originated, so replicas receiving the same two items in either order
    /// converge on the same winner. Returns the item now stored for the
    /// key: the incoming one if it won, the retained one if it lost. The
    /// durable log is appended and flushed before memory is touched; a log
    /// failure fails the update with nothing applied.
    pub async fn apply(&self, item: DataItem) -> NodeResult<DataItem> {
        if item.key < 0 || item.version < 0 {
            return Err(NodeError::Store(format!(
                "invalid argument: key={} version={}",
                item.key, item.version
            )));
        }

        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.data.get(&item.key).copied() {
            if !item.supersedes(&existing) {
                debug!(
                    key = item.key,
                    incoming = item.version,
                    current = existing.version,
                    "ignored superseded update"
                );
                inner.ignored += 1;
                return Ok(existing);
            }
        }

        self.log.append(&item).await?;

        inner.data.insert(item.key, item);
        let capacity = self.ring_capacity;
        inner.push_recent(item, capacity);
        inner.applied += 1;
        inner.next_version = inner.next_version.max(item.version + 1);
        Ok(item)
    }

    /// Strictly increasing version counter, used only by the core peer that
    /// originates a write.
    pub async fn next_version(&self) -> i32 {
        let mut inner = self.inner.lock().await;
        let v = inner.next_version;
        inner.next_version += 1;
        v
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().await;
        StoreStats {
            keys: inner.data.len(),
            updates_applied: inner.applied,
            updates_ignored: inner.ignored,
            next_version: inner.next_version,
        }
    }

    /// Flush the log writers. Further updates remain legal; this exists so
    /// shutdown can guarantee nothing is buffered.
    pub async fn close(&self) -> NodeResult<()> {
        if let Err(e) = self.log.close().await {
            warn!(node_id = %self.node_id, "failed to flush logs on close: {}", e);
            return Err(e);
        }
        Ok(())
    }

    pub fn history_path(&self) -> &Path {
        self.log.history_path()
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("node_id", &self.node_id)
            .field("ring_capacity", &self.ring_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::version_log::VersionLog;
    use tempfile::tempdir;

    #[tokio::test]
    async fn update_is_write_monotone() {
        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 128).unwrap();

        let first = store.update(7, 1, 2).await.unwrap();
        assert_eq!((first.value, first.version), (1, 2));

        // A stale version is ignored and the newer item is returned, no
        // matter how fresh its timestamp is.
        let kept = store.update(7, 99, 1).await.unwrap();
        assert_eq!((kept.value, kept.version), (1, 2));

        // An equal version with an equal-or-older timestamp is also ignored.
        let kept = store
            .apply(DataItem {
                key: 7,
                value: 99,
                version: 2,
                timestamp: first.timestamp,
            })
            .await
            .unwrap();
        assert_eq!(kept.value, 1);

        let newer = store.update(7, 3, 5).await.unwrap();
        assert_eq!((newer.value, newer.version), (3, 5));

        let stats = store.stats().await;
        assert_eq!(stats.updates_applied, 2);
        assert_eq!(stats.updates_ignored, 2);
    }

    #[tokio::test]
    async fn equal_versions_resolve_by_timestamp() {
        // Two core peers can assign the same version to concurrent writes
        // on one key; the later-stamped write must win on every node no
        // matter which arrives first.
        let early = DataItem {
            key: 4,
            value: 1,
            version: 3,
            timestamp: 100,
        };
        let late = DataItem {
            key: 4,
            value: 2,
            version: 3,
            timestamp: 200,
        };

        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 128).unwrap();
        store.apply(early).await.unwrap();
        let kept = store.apply(late).await.unwrap();
        assert_eq!((kept.value, kept.timestamp), (2, 200));

        let dir = tempdir().unwrap();
        let reversed = DataStore::open("a2", dir.path(), 128).unwrap();
        reversed.apply(late).await.unwrap();
        let kept = reversed.apply(early).await.unwrap();
        assert_eq!((kept.value, kept.timestamp), (2, 200));
    }

    #[tokio::test]
    async fn rejects_negative_arguments() {
        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 128).unwrap();
        assert!(store.update(-1, 0, 1).await.is_err());
        assert!(store.update(1, 0, -1).await.is_err());
        assert!(store.get(-1).await.is_none());
    }

    #[tokio::test]
    async fn next_version_is_strictly_increasing() {
        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 128).unwrap();
        let a = store.next_version().await;
        let b = store.next_version().await;
        let c = store.next_version().await;
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn warm_start_resumes_versions_past_the_log() {
        let dir = tempdir().unwrap();
        {
            let store = DataStore::open("a1", dir.path(), 128).unwrap();
            store.update(0, 10, 4).await.unwrap();
            store.update(1, 20, 9).await.unwrap();
            store.close().await.unwrap();
        }

        let store = DataStore::open("a1", dir.path(), 128).unwrap();
        assert_eq!(store.get(0).await.unwrap().value, 10);
        assert_eq!(store.get(1).await.unwrap().value, 20);
        assert_eq!(store.next_version().await, 10);
    }

    #[tokio::test]
    async fn replaying_the_history_reproduces_the_store() {
        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 128).unwrap();
        store.update(0, 1, 1).await.unwrap();
        store.update(0, 2, 3).await.unwrap();
        store.update(5, 7, 2).await.unwrap();
        let expected = store.get_all().await;

        // Apply the history into an empty store in a different directory.
        let records = VersionLog::scan_history(store.history_path()).unwrap();
        let replay_dir = tempdir().unwrap();
        let replayed = DataStore::open("copy", replay_dir.path(), 128).unwrap();
        for record in records {
            replayed.apply(record.item()).await.unwrap();
        }

        assert_eq!(replayed.get_all().await, expected);
    }

    #[tokio::test]
    async fn recent_updates_is_bounded_and_ordered() {
        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 4).unwrap();
        for i in 0..6 {
            store.update(i, i * 10, i + 1).await.unwrap();
        }
        let recent = store.recent_updates(10).await;
        assert_eq!(recent.len(), 4);
        assert_eq!(recent.iter().map(|i| i.key).collect::<Vec<_>>(), vec![2, 3, 4, 5]);

        let last_two = store.recent_updates(2).await;
        assert_eq!(last_two.iter().map(|i| i.key).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn get_all_returns_key_order() {
        let dir = tempdir().unwrap();
        let store = DataStore::open("a1", dir.path(), 128).unwrap();
        store.update(9, 1, 1).await.unwrap();
        store.update(3, 1, 2).await.unwrap();
        store.update(6, 1, 3).await.unwrap();
        let keys: Vec<i32> = store.get_all().await.iter().map(|i| i.key).collect();
        assert_eq!(keys, vec![3, 6, 9]);
    }
}
