//! Materialized state store: the latest published snapshot of every registered index.
//!
//! Each index has exactly one [`SnapshotPublisher`], owned by its worker. Readers clone an
//! `Arc<IndexSnapshot>` out of a watch channel, so a read never waits on a fold and never sees
//! a half-applied one. Watchers get a lazy stream that ends when the publisher is dropped.

use crate::change::Sequence;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Initializing,
    CatchingUp,
    Live,
    Paused,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Initializing => "initializing",
            IndexStatus::CatchingUp => "catching_up",
            IndexStatus::Live => "live",
            IndexStatus::Paused => "paused",
            IndexStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapCause {
    /// Dropped by the drop-and-flag backpressure policy.
    QueueOverflow,
    /// Poisoned change skipped by failure policy or operator resume.
    SkippedChange,
    /// Sequences missing upstream, accepted by operator resume.
    FeedGap,
}

/// Inclusive range of sequences that were not folded into the accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub from: Sequence,
    pub to: Sequence,
    pub cause: GapCause,
}

impl SequenceGap {
    pub fn new(from: Sequence, to: Sequence, cause: GapCause) -> Self {
        SequenceGap { from, to, cause }
    }
}

/// Immutable view of one index at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    pub name: String,
    /// Changes on re-registration, so readers can tell instances apart.
    pub instance_id: Uuid,
    pub value: Arc<Value>,
    /// Last applied sequence; 0 before anything is applied.
    pub sequence: Sequence,
    pub status: IndexStatus,
    /// The value is not tracking the feed (failed or paused).
    pub stale: bool,
    /// Some sequences were never folded; see `gaps`.
    pub partial: bool,
    pub gaps: Vec<SequenceGap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Publish counter, bumped on every snapshot of this instance.
    pub version: u64,
    pub as_of: DateTime<Utc>,
}

impl IndexSnapshot {
    pub(crate) fn initial(name: &str, instance_id: Uuid, value: Arc<Value>) -> Self {
        IndexSnapshot {
            name: name.to_string(),
            instance_id,
            value,
            sequence: 0,
            status: IndexStatus::Initializing,
            stale: false,
            partial: false,
            gaps: Vec::new(),
            failure: None,
            version: 0,
            as_of: Utc::now(),
        }
    }
}

/// What a watcher receives per update.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchUpdate {
    pub value: Arc<Value>,
    pub sequence: Sequence,
    pub status: IndexStatus,
    pub partial: bool,
}

impl From<&IndexSnapshot> for WatchUpdate {
    fn from(s: &IndexSnapshot) -> Self {
        WatchUpdate {
            value: s.value.clone(),
            sequence: s.sequence,
            status: s.status,
            partial: s.partial,
        }
    }
}

/// Single-writer handle for one index. Not cloneable; dropping it ends every watch stream.
#[derive(Debug)]
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<IndexSnapshot>>,
}

impl SnapshotPublisher {
    pub fn publish(&self, snapshot: IndexSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }
}

/// Snapshot stream handed to watchers.
pub type WatchStream = BoxStream<'static, Arc<IndexSnapshot>>;

#[derive(Clone, Debug, Default)]
pub struct MaterializedStore {
    entries: Arc<RwLock<HashMap<String, watch::Receiver<Arc<IndexSnapshot>>>>>,
}

impl MaterializedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a new index instance, replacing any previous one under the same name.
    pub fn insert(&self, initial: IndexSnapshot) -> SnapshotPublisher {
        let name = initial.name.clone();
        let (tx, rx) = watch::channel(Arc::new(initial));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, rx);
        SnapshotPublisher { tx }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<IndexSnapshot>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|rx| rx.borrow().clone())
    }

    /// Snapshots of every index, ordered by name.
    pub fn list(&self) -> Vec<Arc<IndexSnapshot>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = entries.values().map(|rx| rx.borrow().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Current snapshot first, then one item per publish. A slow watcher skips intermediate
    /// snapshots rather than buffering them. The stream ends when the index is unregistered.
    pub fn watch(&self, name: &str) -> Option<WatchStream> {
        let rx = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(name)?.clone()
        };
        let updates = stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first {
                rx.changed().await.ok()?;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, (rx, false)))
        });
        Some(updates.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(name: &str, sequence: Sequence) -> IndexSnapshot {
        let mut s = IndexSnapshot::initial(name, Uuid::new_v4(), Arc::new(json!({})));
        s.sequence = sequence;
        s
    }

    #[test]
    fn get_returns_latest_publish() {
        let store = MaterializedStore::new();
        let publisher = store.insert(snapshot("A", 0));
        let mut next = snapshot("A", 1);
        next.value = Arc::new(json!({"x": 1}));
        publisher.publish(next);
        let got = store.get("A").unwrap();
        assert_eq!(got.sequence, 1);
        assert_eq!(*got.value, json!({"x": 1}));
        assert!(store.get("B").is_none());
    }

    #[test]
    fn held_snapshot_is_unaffected_by_later_publishes() {
        let store = MaterializedStore::new();
        let publisher = store.insert(snapshot("A", 0));
        let held = store.get("A").unwrap();
        publisher.publish(snapshot("A", 5));
        assert_eq!(held.sequence, 0);
        assert_eq!(store.get("A").unwrap().sequence, 5);
    }

    #[test]
    fn list_is_sorted_by_name() {
        let store = MaterializedStore::new();
        let _b = store.insert(snapshot("B", 0));
        let _a = store.insert(snapshot("A", 0));
        let names: Vec<_> = store.list().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn watch_yields_current_then_updates_and_ends_with_publisher() {
        let store = MaterializedStore::new();
        let publisher = store.insert(snapshot("A", 0));
        let mut updates = store.watch("A").unwrap();
        assert_eq!(updates.next().await.unwrap().sequence, 0);
        publisher.publish(snapshot("A", 1));
        assert_eq!(updates.next().await.unwrap().sequence, 1);
        store.remove("A");
        drop(publisher);
        assert!(updates.next().await.is_none());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let v = serde_json::to_value(snapshot("A", 3)).unwrap();
        assert_eq!(v["sequence"], 3);
        assert_eq!(v["status"], "initializing");
        assert!(v.get("asOf").is_some());
        assert!(v.get("failure").is_none());
    }
}
