//! Moves changes from a feed subscription into a worker's bounded inbound queue.

use crate::change::Change;
use crate::config::BackpressurePolicy;
use crate::error::{FeedError, QueueOverflowError};
use crate::feed::ChangeSubscription;
use crate::materialized::{GapCause, SequenceGap};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(crate) enum Delivery {
    Change(Change),
    /// Changes dropped on overflow. Always delivered before any later change.
    Dropped(SequenceGap),
    /// The subscription ended with an error that retries could not absorb. Last item.
    Failed(FeedError),
}

pub(crate) fn spawn(
    index: String,
    subscription: Box<dyn ChangeSubscription>,
    policy: BackpressurePolicy,
    capacity: usize,
) -> (mpsc::Receiver<Delivery>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(run(index, subscription, tx, policy));
    (rx, handle)
}

async fn run(
    index: String,
    mut subscription: Box<dyn ChangeSubscription>,
    tx: mpsc::Sender<Delivery>,
    policy: BackpressurePolicy,
) {
    let mut pending: Option<SequenceGap> = None;
    loop {
        let next = match pending {
            Some(gap) => {
                tokio::select! {
                    biased;
                    permit = tx.reserve() => {
                        let Ok(permit) = permit else { return };
                        let overflow = QueueOverflowError { from: gap.from, to: gap.to };
                        tracing::warn!(index = %index, error = %overflow, "index flagged partial");
                        permit.send(Delivery::Dropped(gap));
                        pending = None;
                        continue;
                    }
                    next = subscription.next() => next,
                }
            }
            None => subscription.next().await,
        };

        let change = match next {
            Ok(change) => change,
            Err(e) => {
                let _ = tx.send(Delivery::Failed(e)).await;
                return;
            }
        };

        match policy {
            BackpressurePolicy::Block => {
                if tx.send(Delivery::Change(change)).await.is_err() {
                    return;
                }
            }
            BackpressurePolicy::DropAndFlag => {
                let sequence = change.sequence;
                if let Some(gap) = pending.as_mut() {
                    gap.from = gap.from.min(sequence);
                    gap.to = gap.to.max(sequence);
                    continue;
                }
                match tx.try_send(Delivery::Change(change)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(index = %index, sequence, "inbound queue full, dropping");
                        pending = Some(SequenceGap::new(sequence, sequence, GapCause::QueueOverflow));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ChangeSink;
    use crate::feed::{ChangeFeed, InMemoryChangeFeed};
    use serde_json::json;

    async fn feed_with(n: u64) -> InMemoryChangeFeed {
        let feed = InMemoryChangeFeed::new();
        for id in 1..=n {
            feed.record_created("tweets", json!({"id": id})).await.unwrap();
        }
        feed
    }

    #[tokio::test]
    async fn block_delivers_everything_in_order() {
        let feed = feed_with(5).await;
        let sub = feed.subscribe("tweets", 0).await.unwrap();
        let (mut rx, pump) = spawn("T".into(), sub, BackpressurePolicy::Block, 1);
        for expected in 1..=5 {
            match rx.recv().await {
                Some(Delivery::Change(c)) => assert_eq!(c.sequence, expected),
                other => panic!("unexpected delivery {:?}", other),
            }
        }
        pump.abort();
    }

    #[tokio::test]
    async fn drop_and_flag_reports_gap_before_later_changes() {
        let feed = feed_with(5).await;
        let sub = feed.subscribe("tweets", 0).await.unwrap();
        let (mut rx, pump) = spawn("T".into(), sub, BackpressurePolicy::DropAndFlag, 1);
        // Let the pump run ahead of the consumer so the queue overflows.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut applied = Vec::new();
        let mut dropped = Vec::new();
        while applied.len() + dropped.len() < 5 {
            match rx.recv().await {
                Some(Delivery::Change(c)) => {
                    assert!(dropped.iter().all(|s| *s < c.sequence));
                    applied.push(c.sequence);
                }
                Some(Delivery::Dropped(gap)) => {
                    assert_eq!(gap.cause, GapCause::QueueOverflow);
                    dropped.extend(gap.from..=gap.to);
                }
                other => panic!("unexpected delivery {:?}", other),
            }
        }
        assert_eq!(applied[0], 1);
        assert!(!dropped.is_empty());
        pump.abort();
    }

    #[tokio::test]
    async fn feed_error_is_forwarded_last() {
        let feed = feed_with(1).await;
        let sub = feed.subscribe("tweets", 0).await.unwrap();
        let (mut rx, _pump) = spawn("T".into(), sub, BackpressurePolicy::Block, 4);
        assert!(matches!(rx.recv().await, Some(Delivery::Change(_))));
        feed.disconnect_subscribers("tweets");
        assert!(matches!(rx.recv().await, Some(Delivery::Failed(FeedError::Disconnected(_)))));
        assert!(rx.recv().await.is_none());
    }
}
