//! Change feed adapters: the subscription point between the storage bridge and index workers.
//!
//! A feed delivers changes per resource type, in sequence order, at least once. Workers never
//! talk to a raw subscription directly; they go through [`ResilientSubscription`], which
//! absorbs disconnects and turns sequence gaps into errors.

mod memory;
mod postgres;
mod retry;

pub use memory::{InMemoryChangeFeed, DEFAULT_KEY_FIELD};
pub use postgres::{PgChangeFeed, PgChangeSink};
pub use retry::{scan_with_retry, ResilientSubscription, RetryPolicy};

use crate::change::{Change, Sequence};
use crate::error::FeedError;
use async_trait::async_trait;

/// Result of `scan_existing`: one synthesized create per stored record, plus the feed head.
///
/// `changes` are ordered by the sequence that last wrote each record. `head` is the last
/// sequence reflected in the scan; live tailing resumes after it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CatchUp {
    pub changes: Vec<Change>,
    pub head: Sequence,
}

/// What an index folds while catching up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchUpSource {
    /// One synthesized create per currently stored record.
    Existing,
    /// Every logged change up to the head, deletes included.
    Log,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Snapshot of currently stored records as create changes, consistent with the returned head.
    async fn scan_existing(&self, resource_type: &str) -> Result<CatchUp, FeedError>;

    /// Every change logged for `resource_type`, in sequence order, up to the returned head.
    ///
    /// Indexes that ignore deletes need this: a record created and then deleted no longer shows
    /// up in `scan_existing`, but it was folded by any index that tailed it.
    async fn replay_log(&self, resource_type: &str) -> Result<CatchUp, FeedError> {
        Err(FeedError::Backend(format!(
            "feed keeps no change log to replay for '{}'",
            resource_type
        )))
    }

    /// Changes with sequence greater than `after`, in order, waiting for new ones indefinitely.
    async fn subscribe(
        &self,
        resource_type: &str,
        after: Sequence,
    ) -> Result<Box<dyn ChangeSubscription>, FeedError>;
}

/// A live tail of one resource type. Dropping it releases the subscription.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Next change. Implementations must be cancel-safe: a dropped call loses nothing.
    async fn next(&mut self) -> Result<Change, FeedError>;
}
