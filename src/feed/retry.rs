//! Reconnecting subscription: absorbs transient feed failures and detects sequence gaps.

use super::{CatchUp, CatchUpSource, ChangeFeed, ChangeSubscription};
use crate::change::{Change, Sequence};
use crate::config::EngineConfig;
use crate::error::FeedError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Backoff before reconnect attempt `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(cfg: &EngineConfig) -> Self {
        RetryPolicy {
            initial_backoff: cfg.retry_initial_backoff(),
            max_backoff: cfg.retry_max_backoff(),
            max_attempts: cfg.retry_max_attempts,
        }
    }
}

/// Catch-up read from `source` with the same backoff as tailing. Only transient errors are retried.
pub async fn scan_with_retry(
    feed: &dyn ChangeFeed,
    resource_type: &str,
    source: CatchUpSource,
    policy: &RetryPolicy,
) -> Result<CatchUp, FeedError> {
    let mut failures = 0;
    loop {
        let scan = match source {
            CatchUpSource::Existing => feed.scan_existing(resource_type).await,
            CatchUpSource::Log => feed.replay_log(resource_type).await,
        };
        match scan {
            Ok(catch_up) => return Ok(catch_up),
            Err(e) if e.is_transient() && failures < policy.max_attempts => {
                failures += 1;
                let delay = policy.backoff(failures);
                tracing::warn!(
                    resource_type,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "scan failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                return Err(FeedError::RetriesExhausted {
                    attempts: failures,
                    last: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a feed subscription for one resource type.
///
/// On a transient error it resubscribes after the last delivered sequence with exponential
/// backoff. Redelivered changes (sequence <= last delivered) are passed through untouched for
/// the consumer to discard. A forward jump in sequence is reported as [`FeedError::Gap`].
pub struct ResilientSubscription {
    feed: Arc<dyn ChangeFeed>,
    resource_type: String,
    last_delivered: Sequence,
    inner: Option<Box<dyn ChangeSubscription>>,
    policy: RetryPolicy,
    /// Consecutive transient failures since the last delivered change. Kept here rather than
    /// in `next` so a cancelled call does not reset the budget.
    failures: u32,
}

impl ResilientSubscription {
    /// Subscribe after `after`, retrying transient failures of the initial subscribe.
    pub async fn connect(
        feed: Arc<dyn ChangeFeed>,
        resource_type: impl Into<String>,
        after: Sequence,
        policy: RetryPolicy,
    ) -> Result<Self, FeedError> {
        let mut sub = ResilientSubscription {
            feed,
            resource_type: resource_type.into(),
            last_delivered: after,
            inner: None,
            policy,
            failures: 0,
        };
        sub.reconnect().await?;
        Ok(sub)
    }

    pub fn last_delivered(&self) -> Sequence {
        self.last_delivered
    }

    /// Subscribe again after `last_delivered`.
    async fn reconnect(&mut self) -> Result<(), FeedError> {
        loop {
            match self.feed.subscribe(&self.resource_type, self.last_delivered).await {
                Ok(sub) => {
                    self.inner = Some(sub);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    self.failures += 1;
                    self.back_off(&e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn back_off(&mut self, cause: &FeedError) -> Result<(), FeedError> {
        let failures = self.failures;
        if failures > self.policy.max_attempts {
            return Err(FeedError::RetriesExhausted {
                attempts: failures - 1,
                last: cause.to_string(),
            });
        }
        let delay = self.policy.backoff(failures);
        tracing::warn!(
            resource_type = %self.resource_type,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            resume_after = self.last_delivered,
            error = %cause,
            "feed disconnected, retrying"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[async_trait]
impl ChangeSubscription for ResilientSubscription {
    async fn next(&mut self) -> Result<Change, FeedError> {
        loop {
            let Some(inner) = self.inner.as_mut() else {
                self.reconnect().await?;
                continue;
            };
            match inner.next().await {
                Ok(change) => {
                    self.failures = 0;
                    if change.sequence <= self.last_delivered {
                        return Ok(change);
                    }
                    let expected = self.last_delivered + 1;
                    if change.sequence != expected {
                        return Err(FeedError::Gap {
                            resource_type: self.resource_type.clone(),
                            expected,
                            found: change.sequence,
                        });
                    }
                    self.last_delivered = change.sequence;
                    return Ok(change);
                }
                Err(e) if e.is_transient() => {
                    self.inner = None;
                    self.failures += 1;
                    self.back_off(&e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ChangeSink;
    use crate::feed::InMemoryChangeFeed;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            max_attempts: 10,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(50));
        assert_eq!(p.backoff(2), Duration::from_millis(100));
        assert_eq!(p.backoff(3), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(300));
        assert_eq!(p.backoff(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn resumes_after_disconnect_without_skipping() {
        let feed = InMemoryChangeFeed::new();
        feed.record_created("tweets", json!({"id": 1})).await.unwrap();
        let mut sub = ResilientSubscription::connect(Arc::new(feed.clone()), "tweets", 0, fast_policy(3))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().sequence, 1);

        feed.disconnect_subscribers("tweets");
        feed.record_created("tweets", json!({"id": 2})).await.unwrap();
        assert_eq!(sub.next().await.unwrap().sequence, 2);
        assert_eq!(sub.last_delivered(), 2);
    }

    #[tokio::test]
    async fn reports_gap_as_error() {
        let feed = InMemoryChangeFeed::new();
        feed.record_created("tweets", json!({"id": 1})).await.unwrap();
        feed.lose_changes("tweets", 1);
        feed.record_created("tweets", json!({"id": 2})).await.unwrap();
        let mut sub = ResilientSubscription::connect(Arc::new(feed), "tweets", 0, fast_policy(3))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().sequence, 1);
        assert_eq!(
            sub.next().await.unwrap_err(),
            FeedError::Gap {
                resource_type: "tweets".into(),
                expected: 2,
                found: 3
            }
        );
    }

    #[tokio::test]
    async fn passes_redelivered_changes_through() {
        let feed = InMemoryChangeFeed::new();
        for id in 1..=2 {
            feed.record_created("tweets", json!({"id": id})).await.unwrap();
        }
        let mut sub = ResilientSubscription::connect(Arc::new(feed.clone()), "tweets", 0, fast_policy(3))
            .await
            .unwrap();
        sub.next().await.unwrap();
        sub.next().await.unwrap();
        feed.redeliver_from("tweets", 1);
        assert_eq!(sub.next().await.unwrap().sequence, 1);
        assert_eq!(sub.last_delivered(), 2);
    }

    /// Feed that is always unreachable.
    struct DownFeed {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ChangeFeed for DownFeed {
        async fn scan_existing(&self, _resource_type: &str) -> Result<CatchUp, FeedError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Disconnected("connection refused".into()))
        }

        async fn subscribe(
            &self,
            _resource_type: &str,
            _after: Sequence,
        ) -> Result<Box<dyn ChangeSubscription>, FeedError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(FeedError::Disconnected("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let feed = Arc::new(DownFeed {
            attempts: AtomicU32::new(0),
        });
        let err = match ResilientSubscription::connect(feed.clone(), "tweets", 0, fast_policy(2)).await {
            Err(e) => e,
            Ok(_) => panic!("expected connect to fail"),
        };
        assert!(matches!(err, FeedError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(feed.attempts.load(Ordering::SeqCst), 3);
    }

    /// Feed that accepts subscriptions whose reads always fail.
    struct DroppingFeed;

    struct DroppedSubscription;

    #[async_trait]
    impl ChangeSubscription for DroppedSubscription {
        async fn next(&mut self) -> Result<Change, FeedError> {
            Err(FeedError::Disconnected("connection reset".into()))
        }
    }

    #[async_trait]
    impl ChangeFeed for DroppingFeed {
        async fn scan_existing(&self, _resource_type: &str) -> Result<CatchUp, FeedError> {
            Ok(CatchUp::default())
        }

        async fn subscribe(
            &self,
            _resource_type: &str,
            _after: Sequence,
        ) -> Result<Box<dyn ChangeSubscription>, FeedError> {
            Ok(Box::new(DroppedSubscription))
        }
    }

    #[tokio::test]
    async fn cancelled_reads_keep_the_failure_count() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(200),
            max_attempts: 2,
        };
        let mut sub = ResilientSubscription::connect(Arc::new(DroppingFeed), "tweets", 0, policy)
            .await
            .unwrap();
        // Each read fails, then gets cancelled while backing off.
        for _ in 0..2 {
            let cut_short = tokio::time::timeout(Duration::from_millis(20), sub.next()).await;
            assert!(cut_short.is_err());
        }
        let err = tokio::time::timeout(Duration::from_millis(100), sub.next())
            .await
            .expect("budget already spent, no further backoff")
            .unwrap_err();
        assert!(matches!(err, FeedError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn scan_gives_up_after_max_attempts() {
        let feed = DownFeed {
            attempts: AtomicU32::new(0),
        };
        let err = scan_with_retry(&feed, "tweets", CatchUpSource::Existing, &fast_policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(feed.attempts.load(Ordering::SeqCst), 3);
    }
}
