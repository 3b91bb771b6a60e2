use crate::change::{Change, Operation, Sequence};
use crate::config::{DeletePolicy, FailurePolicy};
use crate::error::ReducerError;
use crate::materialized::{GapCause, SequenceGap};
use crate::reducer::Reducer;
use crate::registry::IndexDefinition;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Folded value of one index plus the bookkeeping published with it.
///
/// `apply` is the only way the value changes, so replaying the same changes through a fresh
/// accumulator always lands on the same state.
#[derive(Clone, Debug, PartialEq)]
pub struct Accumulator {
    value: Arc<Value>,
    sequence: Sequence,
    gaps: Vec<SequenceGap>,
}

impl Accumulator {
    pub fn new(initial: Value) -> Self {
        Accumulator {
            value: Arc::new(initial),
            sequence: 0,
            gaps: Vec::new(),
        }
    }

    pub fn value(&self) -> &Arc<Value> {
        &self.value
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn gaps(&self) -> &[SequenceGap] {
        &self.gaps
    }

    /// Fold one change under the definition's delete and failure policies.
    ///
    /// An `Err` leaves the accumulator untouched.
    pub fn apply(&mut self, definition: &IndexDefinition, change: &Change) -> Result<(), ReducerError> {
        self.apply_with(definition, change, &HashSet::new())
    }

    /// As [`apply`](Self::apply), stepping over sequences in `skip` as skipped changes.
    pub(crate) fn apply_with(
        &mut self,
        definition: &IndexDefinition,
        change: &Change,
        skip: &HashSet<Sequence>,
    ) -> Result<(), ReducerError> {
        if skip.contains(&change.sequence) {
            self.skip(change.sequence, change.sequence, GapCause::SkippedChange);
            return Ok(());
        }
        if change.operation == Operation::Delete && definition.delete_policy == DeletePolicy::Skip {
            self.sequence = change.sequence;
            return Ok(());
        }

        let retries = match definition.failure_policy {
            FailurePolicy::Retry { max_attempts } => max_attempts,
            FailurePolicy::Halt | FailurePolicy::Skip => 0,
        };
        let mut attempt = 0;
        let error = loop {
            match guarded_apply(definition.reducer.as_ref(), &self.value, change) {
                Ok(value) => {
                    self.value = Arc::new(value);
                    self.sequence = change.sequence;
                    return Ok(());
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!(
                        index = %definition.name,
                        sequence = change.sequence,
                        attempt,
                        error = %e,
                        "reducer failed, retrying"
                    );
                }
                Err(e) => break e,
            }
        };

        if definition.failure_policy == FailurePolicy::Skip {
            tracing::warn!(
                index = %definition.name,
                sequence = change.sequence,
                error = %error,
                "skipping change the reducer rejected"
            );
            self.skip(change.sequence, change.sequence, GapCause::SkippedChange);
            return Ok(());
        }
        Err(error)
    }

    /// Advance past `from..=to` without folding it and record the gap. Sequences at or below
    /// the current one are already accounted for and ignored. False if nothing was recorded.
    pub(crate) fn skip(&mut self, from: Sequence, to: Sequence, cause: GapCause) -> bool {
        let from = from.max(self.sequence + 1);
        if from > to {
            return false;
        }
        match self.gaps.last_mut() {
            Some(last) if last.cause == cause && last.to + 1 == from => last.to = to,
            _ => self.gaps.push(SequenceGap::new(from, to, cause)),
        }
        self.sequence = to;
        true
    }

    /// Raise the sequence to a feed head without folding anything.
    pub(crate) fn advance_to(&mut self, head: Sequence) {
        self.sequence = self.sequence.max(head);
    }
}

fn guarded_apply(reducer: &dyn Reducer, accumulator: &Value, change: &Change) -> Result<Value, ReducerError> {
    panic::catch_unwind(AssertUnwindSafe(|| reducer.apply(accumulator, change))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Err(ReducerError::Panicked(message))
    })
}
