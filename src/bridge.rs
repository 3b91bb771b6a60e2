//! Storage bridge boundary: where accepted mutations become sequenced changes.
//!
//! Validation and persistence of the primary records happen before `emit` is called and are
//! not this crate's concern. Implementations assign the next sequence for the resource type.

use crate::change::{Change, Operation};
use crate::error::FeedError;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Append one change with a freshly assigned sequence and return it.
    async fn emit(
        &self,
        resource_type: &str,
        operation: Operation,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Result<Change, FeedError>;

    async fn record_created(&self, resource_type: &str, after: Value) -> Result<Change, FeedError> {
        self.emit(resource_type, Operation::Create, None, Some(after)).await
    }

    async fn record_updated(&self, resource_type: &str, before: Value, after: Value) -> Result<Change, FeedError> {
        self.emit(resource_type, Operation::Update, Some(before), Some(after)).await
    }

    async fn record_deleted(&self, resource_type: &str, before: Value) -> Result<Change, FeedError> {
        self.emit(resource_type, Operation::Delete, Some(before), None).await
    }
}

/// Shape check shared by sink implementations, run before a sequence is assigned.
pub(crate) fn check_emit(
    resource_type: &str,
    operation: Operation,
    before: &Option<Value>,
    after: &Option<Value>,
) -> Result<(), FeedError> {
    if resource_type.trim().is_empty() {
        return Err(FeedError::InvalidChange("resource type is required".into()));
    }
    crate::change::check_shape(resource_type, operation, before.is_some(), after.is_some())
        .map_err(FeedError::InvalidChange)
}
