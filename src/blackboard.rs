//! Shared blackboard
//!
//! Namespaced key/value store with per-key versioning and change
//! notification. Multiple writers are serialized through the store's lock;
//! watchers are single-shot: each `watch` call registers its own
//! notification and learns only that the key changed, never the value.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

/// One entry of the blackboard's write history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRecord {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub author: String,
    pub version: u64,
    pub timestamp: SystemTime,
}

type Key = (String, String);

struct BoardState {
    entries: HashMap<Key, Value>,
    versions: HashMap<Key, u64>,
    watchers: HashMap<Key, Vec<Arc<Notify>>>,
    history: VecDeque<WriteRecord>,
}

/// Namespaced shared store with versioning and watchers.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Blackboard {
    state: Arc<Mutex<BoardState>>,
    history_capacity: usize,
}

impl Blackboard {
    /// Create a blackboard with the default history bound (1000 writes).
    pub fn new() -> Self {
        Self::with_history_capacity(1000)
    }

    /// Create a blackboard keeping at most `capacity` history entries.
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                entries: HashMap::new(),
                versions: HashMap::new(),
                watchers: HashMap::new(),
                history: VecDeque::new(),
            })),
            history_capacity: capacity,
        }
    }

    /// Write a value, returning the new version for `(namespace, key)`.
    ///
    /// Versions start at 1 and increase monotonically per key. All watchers
    /// registered on the key are woken.
    pub fn write(&self, namespace: &str, key: &str, value: Value, author: &str) -> u64 {
        let full_key = (namespace.to_string(), key.to_string());
        let mut state = self.state.lock();

        let version = state.versions.get(&full_key).copied().unwrap_or(0) + 1;
        state.versions.insert(full_key.clone(), version);
        state.entries.insert(full_key.clone(), value.clone());

        if state.history.len() >= self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(WriteRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            author: author.to_string(),
            version,
            timestamp: SystemTime::now(),
        });

        if let Some(watchers) = state.watchers.get(&full_key) {
            for watcher in watchers {
                watcher.notify_one();
            }
        }

        debug!("blackboard write: {namespace}:{key} v{version} (author={author})");
        version
    }

    /// Snapshot read of a single key.
    pub fn read(&self, namespace: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    /// Snapshot read of every key in a namespace.
    pub fn read_namespace(&self, namespace: &str) -> std::collections::HashMap<String, Value> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Current version of a key (0 if absent).
    pub fn version(&self, namespace: &str, key: &str) -> u64 {
        self.state
            .lock()
            .versions
            .get(&(namespace.to_string(), key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next write to `(namespace, key)`.
    ///
    /// Returns `true` once the key changes, `false` on timeout. The watcher
    /// registration is removed on return either way.
    pub async fn watch(&self, namespace: &str, key: &str, timeout: Option<Duration>) -> bool {
        let full_key = (namespace.to_string(), key.to_string());
        let notify = Arc::new(Notify::new());
        self.state
            .lock()
            .watchers
            .entry(full_key.clone())
            .or_default()
            .push(notify.clone());

        let changed = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, notify.notified())
                .await
                .is_ok(),
            None => {
                notify.notified().await;
                true
            }
        };

        let mut state = self.state.lock();
        if let Some(watchers) = state.watchers.get_mut(&full_key) {
            watchers.retain(|watcher| !Arc::ptr_eq(watcher, &notify));
            if watchers.is_empty() {
                state.watchers.remove(&full_key);
            }
        }
        changed
    }

    /// Delete a key. Returns whether it existed.
    ///
    /// The version counter is removed along with the value: re-creating the
    /// key restarts its version sequence at 1.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        let full_key = (namespace.to_string(), key.to_string());
        let mut state = self.state.lock();
        if state.entries.remove(&full_key).is_some() {
            state.versions.remove(&full_key);
            true
        } else {
            false
        }
    }

    /// Delete every key in a namespace, returning how many were removed.
    pub fn clear_namespace(&self, namespace: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<Key> = state
            .entries
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .cloned()
            .collect();
        for key in &keys {
            state.entries.remove(key);
            state.versions.remove(key);
        }
        keys.len()
    }

    /// The most recent `limit` writes, oldest first.
    pub fn history(&self, limit: usize) -> Vec<WriteRecord> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_starts_at_one_and_increments() {
        let board = Blackboard::new();
        assert_eq!(board.version("ns", "k"), 0);
        assert_eq!(board.write("ns", "k", json!(1), "a"), 1);
        assert_eq!(board.write("ns", "k", json!(2), "a"), 2);
        assert_eq!(board.version("ns", "k"), 2);
        // Versions are tracked per (namespace, key) pair.
        assert_eq!(board.write("other", "k", json!(1), "a"), 1);
    }

    #[test]
    fn test_read_and_namespace_snapshot() {
        let board = Blackboard::new();
        board.write("plan", "step", json!("scan"), "lead");
        board.write("plan", "owner", json!("b"), "lead");
        board.write("scratch", "x", json!(0), "b");

        assert_eq!(board.read("plan", "step"), Some(json!("scan")));
        assert_eq!(board.read("plan", "missing"), None);

        let snapshot = board.read_namespace("plan");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("owner"), Some(&json!("b")));
    }

    #[test]
    fn test_delete_resets_version_sequence() {
        let board = Blackboard::new();
        board.write("ns", "k", json!(1), "a");
        board.write("ns", "k", json!(2), "a");
        assert!(board.delete("ns", "k"));
        assert!(!board.delete("ns", "k"));
        assert_eq!(board.version("ns", "k"), 0);
        assert_eq!(board.write("ns", "k", json!(3), "a"), 1);
    }

    #[test]
    fn test_clear_namespace() {
        let board = Blackboard::new();
        board.write("ns", "a", json!(1), "");
        board.write("ns", "b", json!(2), "");
        board.write("keep", "c", json!(3), "");
        assert_eq!(board.clear_namespace("ns"), 2);
        assert_eq!(board.clear_namespace("ns"), 0);
        assert_eq!(board.read("keep", "c"), Some(json!(3)));
    }

    #[test]
    fn test_history_bounded_and_ordered() {
        let board = Blackboard::with_history_capacity(3);
        for i in 0..5 {
            board.write("ns", "k", json!(i), "a");
        }
        let history = board.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].version, 3);
        assert_eq!(history[2].version, 5);
        assert_eq!(board.history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_watch_wakes_on_write() {
        let board = Blackboard::new();
        let watcher = {
            let board = board.clone();
            tokio::spawn(async move {
                board
                    .watch("ns", "k", Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        board.write("ns", "k", json!("changed"), "a");
        assert!(watcher.await.unwrap());
        // Watcher registrations are single-shot and removed on return.
        assert!(board.state.lock().watchers.is_empty());
    }

    #[tokio::test]
    async fn test_watch_timeout() {
        let board = Blackboard::new();
        assert!(!board.watch("ns", "k", Some(Duration::from_millis(20))).await);
        assert!(board.state.lock().watchers.is_empty());
    }

    #[tokio::test]
    async fn test_watch_other_key_does_not_wake() {
        let board = Blackboard::new();
        let watcher = {
            let board = board.clone();
            tokio::spawn(async move {
                board
                    .watch("ns", "k", Some(Duration::from_millis(50)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        board.write("ns", "unrelated", json!(1), "a");
        assert!(!watcher.await.unwrap());
    }

    proptest::proptest! {
        /// Any interleaving of writes and deletes keeps per-key versions
        /// strictly increasing between deletes.
        #[test]
        fn prop_versions_strictly_monotonic(ops in proptest::collection::vec(0u8..4, 1..50)) {
            let board = Blackboard::new();
            let mut last_version = 0u64;
            for op in ops {
                match op {
                    0..=2 => {
                        let version = board.write("ns", "k", json!(op), "p");
                        proptest::prop_assert!(version > last_version);
                        last_version = version;
                    }
                    _ => {
                        board.delete("ns", "k");
                        last_version = 0;
                    }
                }
            }
        }
    }
}
