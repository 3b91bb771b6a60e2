//! Change records: one immutable mutation of the primary store, as delivered by a change feed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Per-resource-type sequence number. Starts at 1; 0 means "nothing applied yet".
pub type Sequence = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" | "insert" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// A single committed mutation. `before` is set for update/delete, `after` for create/update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub resource_type: String,
    pub operation: Operation,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
    pub sequence: Sequence,
}

impl Change {
    pub fn create(resource_type: impl Into<String>, after: Value, sequence: Sequence) -> Self {
        Change {
            resource_type: resource_type.into(),
            operation: Operation::Create,
            before: None,
            after: Some(after),
            sequence,
        }
    }

    pub fn update(resource_type: impl Into<String>, before: Value, after: Value, sequence: Sequence) -> Self {
        Change {
            resource_type: resource_type.into(),
            operation: Operation::Update,
            before: Some(before),
            after: Some(after),
            sequence,
        }
    }

    pub fn delete(resource_type: impl Into<String>, before: Value, sequence: Sequence) -> Self {
        Change {
            resource_type: resource_type.into(),
            operation: Operation::Delete,
            before: Some(before),
            after: None,
            sequence,
        }
    }

    /// The record this change is about: `after` when present, otherwise `before`.
    pub fn record(&self) -> Option<&Value> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Checks that before/after presence matches the operation.
    pub fn check_shape(&self) -> Result<(), String> {
        check_shape(
            &self.resource_type,
            self.operation,
            self.before.is_some(),
            self.after.is_some(),
        )
    }
}

pub(crate) fn check_shape(
    resource_type: &str,
    operation: Operation,
    has_before: bool,
    has_after: bool,
) -> Result<(), String> {
    match (operation, has_before, has_after) {
        (Operation::Create, _, true) => Ok(()),
        (Operation::Update, true, true) => Ok(()),
        (Operation::Delete, true, _) => Ok(()),
        (op, _, _) => Err(format!(
            "{} change for '{}' is missing its {} record",
            op,
            resource_type,
            if op == Operation::Create { "after" } else { "before" }
        )),
    }
}

/// Read a record's key field as a string (strings as-is, numbers and bools via Display).
pub fn record_key(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
