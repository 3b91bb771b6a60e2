//! Built-in reducers addressable from config.

use super::Reducer;
use crate::change::{Change, Operation};
use crate::error::ReducerError;
use serde_json::{json, Map, Value};

/// Counts live records: +1 on create, -1 on delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountReducer;

impl Reducer for CountReducer {
    fn apply(&self, accumulator: &Value, change: &Change) -> Result<Value, ReducerError> {
        let current = accumulator
            .as_i64()
            .ok_or(ReducerError::InvalidAccumulator("an integer"))?;
        let next = match change.operation {
            Operation::Create => current + 1,
            Operation::Update => current,
            Operation::Delete => current - 1,
        };
        Ok(json!(next))
    }

    fn empty(&self) -> Value {
        json!(0)
    }
}

/// Live record count per distinct value of `field`. Groups that drop to zero are removed.
#[derive(Debug, Clone)]
pub struct CountBy {
    field: String,
}

impl CountBy {
    pub fn new(field: impl Into<String>) -> Self {
        CountBy { field: field.into() }
    }
}

impl Reducer for CountBy {
    fn apply(&self, accumulator: &Value, change: &Change) -> Result<Value, ReducerError> {
        let mut groups = object(accumulator)?;
        match change.operation {
            Operation::Create => {
                let key = group_key(after(change)?, &self.field)?;
                adjust_count(&mut groups, key, 1);
            }
            Operation::Update => {
                let old = group_key(before(change)?, &self.field)?;
                let new = group_key(after(change)?, &self.field)?;
                if old != new {
                    adjust_count(&mut groups, old, -1);
                    adjust_count(&mut groups, new, 1);
                }
            }
            Operation::Delete => {
                let key = group_key(before(change)?, &self.field)?;
                adjust_count(&mut groups, key, -1);
            }
        }
        Ok(Value::Object(groups))
    }
}

fn adjust_count(groups: &mut Map<String, Value>, key: String, delta: i64) {
    let next = groups.get(&key).and_then(Value::as_i64).unwrap_or(0) + delta;
    if next == 0 {
        groups.remove(&key);
    } else {
        groups.insert(key, json!(next));
    }
}

/// Running `{ sum, count }` of a numeric field, either overall or per group.
#[derive(Debug, Clone)]
pub struct SumBy {
    value_field: String,
    group_field: Option<String>,
}

impl SumBy {
    pub fn new(value_field: impl Into<String>, group_field: Option<String>) -> Self {
        SumBy {
            value_field: value_field.into(),
            group_field,
        }
    }

    fn contribution(&self, record: &Value) -> Result<(Option<String>, f64), ReducerError> {
        let raw = record
            .get(&self.value_field)
            .ok_or_else(|| ReducerError::MissingField(self.value_field.clone()))?;
        let amount = raw.as_f64().ok_or_else(|| ReducerError::InvalidField {
            field: self.value_field.clone(),
            expected: "a number",
        })?;
        let group = match &self.group_field {
            Some(field) => Some(group_key(record, field)?),
            None => None,
        };
        Ok((group, amount))
    }

    fn fold(&self, acc: &mut Value, contribution: (Option<String>, f64), sign: f64) -> Result<(), ReducerError> {
        let (group, amount) = contribution;
        match group {
            None => add_to_total(acc, amount * sign, sign as i64),
            Some(key) => {
                let groups = acc
                    .as_object_mut()
                    .ok_or(ReducerError::InvalidAccumulator("an object of groups"))?;
                let mut entry = groups.remove(&key).unwrap_or_else(|| json!({ "sum": 0, "count": 0 }));
                add_to_total(&mut entry, amount * sign, sign as i64)?;
                if entry.get("count").and_then(Value::as_i64).unwrap_or(0) != 0 {
                    groups.insert(key, entry);
                }
                Ok(())
            }
        }
    }
}

impl Reducer for SumBy {
    fn apply(&self, accumulator: &Value, change: &Change) -> Result<Value, ReducerError> {
        let mut acc = accumulator.clone();
        match change.operation {
            Operation::Create => {
                let c = self.contribution(after(change)?)?;
                self.fold(&mut acc, c, 1.0)?;
            }
            Operation::Update => {
                let old = self.contribution(before(change)?)?;
                let new = self.contribution(after(change)?)?;
                self.fold(&mut acc, old, -1.0)?;
                self.fold(&mut acc, new, 1.0)?;
            }
            Operation::Delete => {
                let c = self.contribution(before(change)?)?;
                self.fold(&mut acc, c, -1.0)?;
            }
        }
        Ok(acc)
    }

    fn empty(&self) -> Value {
        match self.group_field {
            Some(_) => json!({}),
            None => json!({ "sum": 0, "count": 0 }),
        }
    }
}

fn add_to_total(total: &mut Value, amount: f64, count_delta: i64) -> Result<(), ReducerError> {
    let obj = total
        .as_object_mut()
        .ok_or(ReducerError::InvalidAccumulator("a { sum, count } object"))?;
    let sum = obj.get("sum").and_then(Value::as_f64).unwrap_or(0.0) + amount;
    let count = obj.get("count").and_then(Value::as_i64).unwrap_or(0) + count_delta;
    obj.insert("sum".into(), number(sum));
    obj.insert("count".into(), json!(count));
    Ok(())
}

/// Integral sums stay JSON integers so they compare equal to integer initial values.
fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        json!(f as i64)
    } else {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Latest record per key. Deletes remove the key; an update that changes the key moves it.
#[derive(Debug, Clone)]
pub struct LatestByKey {
    key_field: String,
}

impl LatestByKey {
    pub fn new(key_field: impl Into<String>) -> Self {
        LatestByKey { key_field: key_field.into() }
    }
}

impl Reducer for LatestByKey {
    fn apply(&self, accumulator: &Value, change: &Change) -> Result<Value, ReducerError> {
        let mut records = object(accumulator)?;
        if let Some(old) = change.before.as_ref() {
            records.remove(&group_key(old, &self.key_field)?);
        }
        if change.operation != Operation::Delete {
            let new = after(change)?;
            records.insert(group_key(new, &self.key_field)?, new.clone());
        }
        Ok(Value::Object(records))
    }
}

fn object(accumulator: &Value) -> Result<Map<String, Value>, ReducerError> {
    accumulator
        .as_object()
        .cloned()
        .ok_or(ReducerError::InvalidAccumulator("an object"))
}

fn before(change: &Change) -> Result<&Value, ReducerError> {
    change.before.as_ref().ok_or(ReducerError::MissingRecord)
}

fn after(change: &Change) -> Result<&Value, ReducerError> {
    change.after.as_ref().ok_or(ReducerError::MissingRecord)
}

fn group_key(record: &Value, field: &str) -> Result<String, ReducerError> {
    match record.get(field) {
        None | Some(Value::Null) => Err(ReducerError::MissingField(field.to_string())),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(_) => Err(ReducerError::InvalidField {
            field: field.to_string(),
            expected: "a group key",
        }),
    }
}
