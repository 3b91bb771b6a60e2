//! Raw config types: declarative index registrations and engine tuning.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Built-in reducer selection. `kind` picks the reducer, remaining keys are its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReducerConfig {
    /// Number of live records.
    Count,
    /// Live records grouped by the value of `field` (e.g. count-by-author).
    CountBy { field: String },
    /// Running `{ sum, count }` of `value_field`, optionally grouped by `group_field`.
    SumBy {
        value_field: String,
        #[serde(default)]
        group_field: Option<String>,
    },
    /// Latest record per `key_field`; deletes remove the key.
    LatestByKey { key_field: String },
}

/// What the feed-to-worker queue does when it is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Stall the feed until the worker drains the queue.
    #[default]
    Block,
    /// Drop the change, record the gap and flag the index as partial.
    DropAndFlag,
}

/// Automatic handling of a reducer error. Operator resume is available under every policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Halt,
    Skip,
    Retry { max_attempts: u32 },
}

/// Whether delete changes reach the reducer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    #[default]
    Fold,
    /// Deletes advance the sequence without being folded.
    Skip,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    #[serde(alias = "sourceResourceType", alias = "resource_type")]
    pub source_resource_type: String,
    pub reducer: ReducerConfig,
    /// Defaults to the reducer's natural empty value (`0` for count, `{}` otherwise).
    #[serde(default, alias = "initialValue")]
    pub initial_value: Option<Value>,
    #[serde(default, alias = "backpressurePolicy")]
    pub backpressure_policy: BackpressurePolicy,
    #[serde(default, alias = "failurePolicy")]
    pub failure_policy: FailurePolicy,
    #[serde(default, alias = "deletePolicy")]
    pub delete_policy: DeletePolicy,
}

/// Engine tuning shared by every index worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub catch_up_timeout_ms: u64,
    pub queue_capacity: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catch_up_timeout_ms: 30_000,
            queue_capacity: 1024,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 5_000,
            retry_max_attempts: 8,
        }
    }
}

impl EngineConfig {
    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn index_config_accepts_camel_case_keys() {
        let cfg: IndexConfig = serde_json::from_value(json!({
            "name": "AuthorCounts",
            "sourceResourceType": "tweets",
            "reducer": { "kind": "count_by", "field": "author" },
            "initialValue": {},
            "backpressurePolicy": "drop_and_flag"
        }))
        .unwrap();
        assert_eq!(cfg.source_resource_type, "tweets");
        assert_eq!(cfg.reducer, ReducerConfig::CountBy { field: "author".into() });
        assert_eq!(cfg.initial_value, Some(json!({})));
        assert_eq!(cfg.backpressure_policy, BackpressurePolicy::DropAndFlag);
        assert_eq!(cfg.failure_policy, FailurePolicy::Halt);
        assert_eq!(cfg.delete_policy, DeletePolicy::Fold);
    }

    #[test]
    fn failure_policy_retry_carries_attempts() {
        let p: FailurePolicy = serde_json::from_value(json!({ "mode": "retry", "max_attempts": 3 })).unwrap();
        assert_eq!(p, FailurePolicy::Retry { max_attempts: 3 });
    }

    #[test]
    fn engine_config_fills_missing_fields() {
        let cfg: EngineConfig = serde_json::from_value(json!({ "queue_capacity": 4 })).unwrap();
        assert_eq!(cfg.queue_capacity, 4);
        assert_eq!(cfg.catch_up_timeout(), Duration::from_secs(30));
    }
}
