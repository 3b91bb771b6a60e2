//! Reducers: pure folds of (accumulator, change) into a new accumulator.

mod builtin;

pub use builtin::{CountBy, CountReducer, LatestByKey, SumBy};

use crate::change::Change;
use crate::config::ReducerConfig;
use crate::error::ReducerError;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// One fold step of a materialized index.
///
/// Implementations must be pure: the result may depend only on `accumulator` and `change`.
/// Replay after a restart and catch-up/tail equivalence both rely on it.
pub trait Reducer: fmt::Debug + Send + Sync {
    fn apply(&self, accumulator: &Value, change: &Change) -> Result<Value, ReducerError>;

    /// The accumulator an index starts from when registration does not give one.
    fn empty(&self) -> Value {
        json!({})
    }
}

/// Build the reducer named by a config entry.
pub fn build(config: &ReducerConfig) -> Arc<dyn Reducer> {
    match config {
        ReducerConfig::Count => Arc::new(CountReducer),
        ReducerConfig::CountBy { field } => Arc::new(CountBy::new(field.clone())),
        ReducerConfig::SumBy { value_field, group_field } => {
            Arc::new(SumBy::new(value_field.clone(), group_field.clone()))
        }
        ReducerConfig::LatestByKey { key_field } => Arc::new(LatestByKey::new(key_field.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_picks_natural_empty_value() {
        assert_eq!(build(&ReducerConfig::Count).empty(), json!(0));
        assert_eq!(build(&ReducerConfig::CountBy { field: "author".into() }).empty(), json!({}));
        assert_eq!(
            build(&ReducerConfig::SumBy { value_field: "likes".into(), group_field: None }).empty(),
            json!({ "sum": 0, "count": 0 })
        );
    }
}
