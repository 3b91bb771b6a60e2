//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use futures_util::StreamExt;
use materialize_sdk::reducer::CountBy;
use materialize_sdk::{ChangeFeed, EngineConfig, IndexDefinition, IndexRegistry, IndexSnapshot, IndexStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        catch_up_timeout_ms: 5_000,
        queue_capacity: 64,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 10,
        retry_max_attempts: 5,
    }
}

pub fn registry(feed: Arc<dyn ChangeFeed>) -> Arc<IndexRegistry> {
    IndexRegistry::init(feed, engine_config())
}

pub fn tweet(id: u64, author: &str) -> Value {
    json!({ "id": id, "author": author, "text": format!("tweet {}", id) })
}

pub fn author_counts() -> IndexDefinition {
    IndexDefinition::new("AuthorCounts", "tweets", Arc::new(CountBy::new("author"))).with_initial_value(json!({}))
}

/// Block until the index publishes a snapshot matching `pred`.
pub async fn wait_for(
    registry: &IndexRegistry,
    name: &str,
    pred: impl Fn(&IndexSnapshot) -> bool,
) -> Arc<IndexSnapshot> {
    let mut updates = registry.watch(name).expect("index is registered");
    let found = tokio::time::timeout(WAIT, async {
        while let Some(snapshot) = updates.next().await {
            if pred(&snapshot) {
                return Some(snapshot);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => panic!("index '{}' went away while waiting", name),
        Err(_) => panic!("timed out waiting on '{}', last seen {:?}", name, registry.get(name).ok()),
    }
}

pub async fn wait_live_at(registry: &IndexRegistry, name: &str, sequence: u64) -> Arc<IndexSnapshot> {
    wait_for(registry, name, |s| s.status == IndexStatus::Live && s.sequence == sequence).await
}

pub async fn wait_status(registry: &IndexRegistry, name: &str, status: IndexStatus) -> Arc<IndexSnapshot> {
    wait_for(registry, name, |s| s.status == status).await
}
