//! In-process change feed and bridge sink. Keeps the full change log and the current record set
//! per resource type, so catch-up and tailing can be served from memory.

use super::{CatchUp, ChangeFeed, ChangeSubscription};
use crate::bridge::{check_emit, ChangeSink};
use crate::change::{record_key, Change, Operation, Sequence};
use crate::error::FeedError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;

/// Record field used as the record identity when none is configured.
pub const DEFAULT_KEY_FIELD: &str = "id";

#[derive(Clone, Debug)]
pub struct InMemoryChangeFeed {
    inner: Arc<FeedInner>,
}

#[derive(Debug)]
struct FeedInner {
    key_field: String,
    streams: RwLock<HashMap<String, Arc<ResourceStream>>>,
}

#[derive(Debug)]
struct ResourceStream {
    state: RwLock<StreamState>,
    /// Last assigned sequence; subscribers wait on it.
    head: watch::Sender<Sequence>,
    /// Bumped to drop every open subscription.
    disconnects: AtomicU64,
    /// (epoch, from): open subscriptions rewind to `from` once per epoch.
    rewind: Mutex<(u64, Sequence)>,
}

#[derive(Debug)]
struct StreamState {
    next_sequence: Sequence,
    log: Vec<Change>,
    /// Current records by key, with the sequence that last wrote them.
    records: HashMap<String, (Sequence, Value)>,
}

impl ResourceStream {
    fn new() -> Self {
        let (head, _) = watch::channel(0);
        ResourceStream {
            state: RwLock::new(StreamState {
                next_sequence: 1,
                log: Vec::new(),
                records: HashMap::new(),
            }),
            head,
            disconnects: AtomicU64::new(0),
            rewind: Mutex::new((0, 0)),
        }
    }

    fn change_after(&self, cursor: Sequence) -> Option<Change> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let idx = state.log.partition_point(|c| c.sequence <= cursor);
        state.log.get(idx).cloned()
    }

    fn wake(&self) {
        self.head.send_modify(|_| {});
    }
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::with_key_field(DEFAULT_KEY_FIELD)
    }

    /// Records are identified by `key_field`; every emitted record must carry it.
    pub fn with_key_field(key_field: impl Into<String>) -> Self {
        InMemoryChangeFeed {
            inner: Arc::new(FeedInner {
                key_field: key_field.into(),
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn stream(&self, resource_type: &str) -> Arc<ResourceStream> {
        if let Some(s) = self
            .inner
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_type)
        {
            return s.clone();
        }
        let mut streams = self.inner.streams.write().unwrap_or_else(PoisonError::into_inner);
        streams
            .entry(resource_type.to_string())
            .or_insert_with(|| Arc::new(ResourceStream::new()))
            .clone()
    }

    /// Last sequence assigned for a resource type (0 if none).
    pub fn head(&self, resource_type: &str) -> Sequence {
        *self.stream(resource_type).head.borrow()
    }

    /// Full change log of a resource type, in sequence order.
    pub fn changes(&self, resource_type: &str) -> Vec<Change> {
        let stream = self.stream(resource_type);
        let state = stream.state.read().unwrap_or_else(PoisonError::into_inner);
        state.log.clone()
    }

    /// Drop every open subscription on `resource_type`; their next read fails as disconnected.
    pub fn disconnect_subscribers(&self, resource_type: &str) {
        let stream = self.stream(resource_type);
        stream.disconnects.fetch_add(1, Ordering::AcqRel);
        stream.wake();
        tracing::debug!(resource_type, "dropped feed subscribers");
    }

    /// Make open subscriptions deliver again from `from` (at-least-once redelivery).
    pub fn redeliver_from(&self, resource_type: &str, from: Sequence) {
        let stream = self.stream(resource_type);
        {
            let mut rewind = stream.rewind.lock().unwrap_or_else(PoisonError::into_inner);
            *rewind = (rewind.0 + 1, from);
        }
        stream.wake();
    }

    /// Burn `count` sequence numbers without logging them, as if upstream lost those changes.
    pub fn lose_changes(&self, resource_type: &str, count: u64) {
        let stream = self.stream(resource_type);
        let mut state = stream.state.write().unwrap_or_else(PoisonError::into_inner);
        state.next_sequence += count;
        stream.head.send_replace(state.next_sequence - 1);
    }
}

#[async_trait]
impl ChangeSink for InMemoryChangeFeed {
    async fn emit(
        &self,
        resource_type: &str,
        operation: Operation,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Result<Change, FeedError> {
        check_emit(resource_type, operation, &before, &after)?;
        let key_field = &self.inner.key_field;
        let before_key = match &before {
            Some(record) => Some(record_key(record, key_field).ok_or_else(|| {
                FeedError::InvalidChange(format!("before record has no '{}' key", key_field))
            })?),
            None => None,
        };
        let after_key = match &after {
            Some(record) => Some(record_key(record, key_field).ok_or_else(|| {
                FeedError::InvalidChange(format!("after record has no '{}' key", key_field))
            })?),
            None => None,
        };

        let stream = self.stream(resource_type);
        let change = {
            let mut state = stream
                .state
                .write()
                .map_err(|_| FeedError::Backend("change log lock poisoned".into()))?;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            if let Some(key) = &before_key {
                state.records.remove(key);
            }
            if let (Some(key), Some(record)) = (after_key, &after) {
                state.records.insert(key, (sequence, record.clone()));
            }
            let change = Change {
                resource_type: resource_type.to_string(),
                operation,
                before,
                after,
                sequence,
            };
            state.log.push(change.clone());
            // Still under the write lock, so concurrent emits publish heads in sequence order.
            stream.head.send_replace(sequence);
            change
        };
        tracing::debug!(resource_type, sequence = change.sequence, operation = %operation, "emitted change");
        Ok(change)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn scan_existing(&self, resource_type: &str) -> Result<CatchUp, FeedError> {
        let stream = self.stream(resource_type);
        let state = stream.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<_> = state.records.values().collect();
        records.sort_by_key(|(sequence, _)| *sequence);
        let changes = records
            .into_iter()
            .map(|(sequence, record)| Change::create(resource_type, record.clone(), *sequence))
            .collect();
        Ok(CatchUp {
            changes,
            head: state.next_sequence - 1,
        })
    }

    async fn replay_log(&self, resource_type: &str) -> Result<CatchUp, FeedError> {
        let stream = self.stream(resource_type);
        let state = stream.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(CatchUp {
            changes: state.log.clone(),
            head: state.next_sequence - 1,
        })
    }

    async fn subscribe(
        &self,
        resource_type: &str,
        after: Sequence,
    ) -> Result<Box<dyn ChangeSubscription>, FeedError> {
        let stream = self.stream(resource_type);
        let disconnect_epoch = stream.disconnects.load(Ordering::Acquire);
        let rewind_epoch = stream.rewind.lock().unwrap_or_else(PoisonError::into_inner).0;
        let head = stream.head.subscribe();
        Ok(Box::new(MemorySubscription {
            resource_type: resource_type.to_string(),
            stream,
            head,
            cursor: after,
            disconnect_epoch,
            rewind_epoch,
        }))
    }
}

struct MemorySubscription {
    resource_type: String,
    stream: Arc<ResourceStream>,
    head: watch::Receiver<Sequence>,
    cursor: Sequence,
    disconnect_epoch: u64,
    rewind_epoch: u64,
}

#[async_trait]
impl ChangeSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Change, FeedError> {
        loop {
            // Mark the head seen before reading the log so a concurrent emit always wakes us.
            let _ = self.head.borrow_and_update();
            if self.stream.disconnects.load(Ordering::Acquire) != self.disconnect_epoch {
                return Err(FeedError::Disconnected(format!(
                    "subscription to '{}' dropped",
                    self.resource_type
                )));
            }
            {
                let (epoch, from) = *self.stream.rewind.lock().unwrap_or_else(PoisonError::into_inner);
                if epoch != self.rewind_epoch {
                    self.rewind_epoch = epoch;
                    self.cursor = self.cursor.min(from.saturating_sub(1));
                }
            }
            if let Some(change) = self.stream.change_after(self.cursor) {
                self.cursor = change.sequence;
                return Ok(change);
            }
            self.head.changed().await.map_err(|_| FeedError::Closed)?;
        }
    }
}
