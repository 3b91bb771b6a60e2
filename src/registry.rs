//! Index definition registry: process-wide set of registered indexes and their workers.
//!
//! Created with [`IndexRegistry::init`], torn down with [`IndexRegistry::shutdown`], and passed
//! by `Arc` to whatever needs to register or query indexes.

use crate::config::{
    validate_index_name, BackpressurePolicy, DeletePolicy, EngineConfig, FailurePolicy, IndexConfig,
};
use crate::engine::{self, Command, ResumePolicy, WorkerHandle};
use crate::error::AppError;
use crate::feed::{CatchUpSource, ChangeFeed};
use crate::materialized::{IndexSnapshot, IndexStatus, MaterializedStore, WatchStream};
use crate::reducer::{self, Reducer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// What to fold, from where, and how to react when things go wrong.
#[derive(Clone, Debug)]
pub struct IndexDefinition {
    pub name: String,
    pub source_resource_type: String,
    pub reducer: Arc<dyn Reducer>,
    pub initial_value: Value,
    pub backpressure_policy: BackpressurePolicy,
    pub failure_policy: FailurePolicy,
    pub delete_policy: DeletePolicy,
}

impl IndexDefinition {
    /// Default policies; the initial value is the reducer's empty value.
    pub fn new(name: impl Into<String>, source_resource_type: impl Into<String>, reducer: Arc<dyn Reducer>) -> Self {
        let initial_value = reducer.empty();
        IndexDefinition {
            name: name.into(),
            source_resource_type: source_resource_type.into(),
            reducer,
            initial_value,
            backpressure_policy: BackpressurePolicy::default(),
            failure_policy: FailurePolicy::default(),
            delete_policy: DeletePolicy::default(),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        let mut def = Self::new(
            config.name.clone(),
            config.source_resource_type.clone(),
            reducer::build(&config.reducer),
        )
        .with_backpressure_policy(config.backpressure_policy)
        .with_failure_policy(config.failure_policy)
        .with_delete_policy(config.delete_policy);
        if let Some(initial) = &config.initial_value {
            def.initial_value = initial.clone();
        }
        def
    }

    pub fn with_initial_value(mut self, value: Value) -> Self {
        self.initial_value = value;
        self
    }

    pub fn with_backpressure_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure_policy = policy;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Records deleted before registration still count toward an index that skips deletes,
    /// so such an index catches up from the full log instead of the current records.
    pub fn catch_up_source(&self) -> CatchUpSource {
        match self.delete_policy {
            DeletePolicy::Fold => CatchUpSource::Existing,
            DeletePolicy::Skip => CatchUpSource::Log,
        }
    }
}

struct Entry {
    definition: Arc<IndexDefinition>,
    worker: WorkerHandle,
}

pub struct IndexRegistry {
    feed: Arc<dyn ChangeFeed>,
    config: EngineConfig,
    store: MaterializedStore,
    entries: Mutex<HashMap<String, Entry>>,
    closed: AtomicBool,
}

impl IndexRegistry {
    /// Empty registry reading from `feed`.
    pub fn init(feed: Arc<dyn ChangeFeed>, config: EngineConfig) -> Arc<Self> {
        Arc::new(IndexRegistry {
            feed,
            config,
            store: MaterializedStore::new(),
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the index state and start its worker. Returns the new instance id.
    pub fn register(&self, definition: IndexDefinition) -> Result<Uuid, AppError> {
        validate_index_name(&definition.name)?;
        if definition.source_resource_type.trim().is_empty() {
            return Err(AppError::BadRequest("source resource type must not be empty".into()));
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::Conflict("registry is shut down".into()));
        }
        if entries.contains_key(&definition.name) {
            return Err(AppError::DuplicateIndex(definition.name));
        }

        let definition = Arc::new(definition);
        let instance_id = Uuid::new_v4();
        let publisher = self.store.insert(IndexSnapshot::initial(
            &definition.name,
            instance_id,
            Arc::new(definition.initial_value.clone()),
        ));
        let worker = engine::spawn(
            definition.clone(),
            self.feed.clone(),
            self.config.clone(),
            instance_id,
            publisher,
        );
        tracing::info!(
            index = %definition.name,
            resource_type = %definition.source_resource_type,
            instance_id = %instance_id,
            "index registered"
        );
        entries.insert(definition.name.clone(), Entry { definition, worker });
        Ok(instance_id)
    }

    pub fn register_config(&self, config: &IndexConfig) -> Result<Uuid, AppError> {
        self.register(IndexDefinition::from_config(config))
    }

    /// Stop the worker and drop the index state. Watch streams on it end.
    pub async fn unregister(&self, name: &str) -> Result<(), AppError> {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = entries
                .remove(name)
                .ok_or_else(|| AppError::NotFound(format!("index '{}'", name)))?;
            self.store.remove(name);
            entry
        };
        entry.worker.stop().await;
        tracing::info!(index = %name, "index unregistered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<IndexSnapshot>, AppError> {
        self.store
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("index '{}'", name)))
    }

    pub fn watch(&self, name: &str) -> Result<WatchStream, AppError> {
        self.store
            .watch(name)
            .ok_or_else(|| AppError::NotFound(format!("index '{}'", name)))
    }

    pub fn list(&self) -> Vec<Arc<IndexSnapshot>> {
        self.store.list()
    }

    pub fn definition(&self, name: &str) -> Option<Arc<IndexDefinition>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|e| e.definition.clone())
    }

    pub fn pause(&self, name: &str) -> Result<(), AppError> {
        self.command(name, Command::Pause, &[IndexStatus::Live])
    }

    /// Resume a paused or failed index. `policy` only matters for a failed one.
    pub fn resume(&self, name: &str, policy: ResumePolicy) -> Result<(), AppError> {
        self.command(name, Command::Resume(policy), &[IndexStatus::Paused, IndexStatus::Failed])
    }

    fn command(&self, name: &str, command: Command, allowed: &[IndexStatus]) -> Result<(), AppError> {
        let snapshot = self.get(name)?;
        if !allowed.contains(&snapshot.status) {
            return Err(AppError::Conflict(format!(
                "index '{}' is {}",
                name,
                snapshot.status.as_str()
            )));
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("index '{}'", name)))?;
        entry.worker.send(command)
    }

    /// Stop every worker and clear the registry. Later registrations are rejected.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Entry)> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            entries.drain().collect()
        };
        for (name, _) in &drained {
            self.store.remove(name);
        }
        let count = drained.len();
        futures_util::future::join_all(drained.into_iter().map(|(_, entry)| entry.worker.stop())).await;
        tracing::info!(indexes = count, "index registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReducerConfig;
    use crate::feed::InMemoryChangeFeed;
    use crate::reducer::CountBy;
    use serde_json::json;

    fn registry() -> Arc<IndexRegistry> {
        IndexRegistry::init(Arc::new(InMemoryChangeFeed::new()), EngineConfig::default())
    }

    fn author_counts() -> IndexDefinition {
        IndexDefinition::new("AuthorCounts", "tweets", Arc::new(CountBy::new("author")))
    }

    #[test]
    fn definition_from_config_uses_reducer_empty_value() {
        let cfg = IndexConfig {
            name: "Total".into(),
            source_resource_type: "tweets".into(),
            reducer: ReducerConfig::Count,
            initial_value: None,
            backpressure_policy: BackpressurePolicy::DropAndFlag,
            failure_policy: FailurePolicy::Skip,
            delete_policy: DeletePolicy::Fold,
        };
        let def = IndexDefinition::from_config(&cfg);
        assert_eq!(def.initial_value, json!(0));
        assert_eq!(def.backpressure_policy, BackpressurePolicy::DropAndFlag);
        assert_eq!(def.failure_policy, FailurePolicy::Skip);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let reg = registry();
        reg.register(author_counts()).unwrap();
        assert!(matches!(
            reg.register(author_counts()),
            Err(AppError::DuplicateIndex(name)) if name == "AuthorCounts"
        ));
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let reg = registry();
        let def = IndexDefinition::new("9 lives", "tweets", Arc::new(CountBy::new("author")));
        assert!(matches!(reg.register(def), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn unregister_unknown_is_not_found() {
        let reg = registry();
        assert!(matches!(reg.unregister("Nope").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn unregister_removes_state() {
        let reg = registry();
        reg.register(author_counts()).unwrap();
        assert!(reg.get("AuthorCounts").is_ok());
        reg.unregister("AuthorCounts").await.unwrap();
        assert!(matches!(reg.get("AuthorCounts"), Err(AppError::NotFound(_))));
        assert!(reg.definition("AuthorCounts").is_none());
    }

    #[tokio::test]
    async fn shutdown_clears_and_closes() {
        let reg = registry();
        reg.register(author_counts()).unwrap();
        reg.shutdown().await;
        assert!(reg.list().is_empty());
        assert!(matches!(reg.register(author_counts()), Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn resume_requires_paused_or_failed() {
        let reg = registry();
        reg.register(author_counts()).unwrap();
        // Before catch-up finishes the index is initializing or live, never paused.
        assert!(matches!(
            reg.resume("AuthorCounts", ResumePolicy::Retry),
            Err(AppError::Conflict(_))
        ));
        reg.shutdown().await;
    }
}
