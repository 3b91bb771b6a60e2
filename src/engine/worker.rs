use super::accumulator::Accumulator;
use super::pump::{self, Delivery};
use super::{Command, ResumePolicy};
use crate::change::{Change, Sequence};
use crate::config::EngineConfig;
use crate::error::{FailureReason, FeedError};
use crate::feed::{scan_with_retry, ChangeFeed, ResilientSubscription, RetryPolicy};
use crate::materialized::{GapCause, IndexSnapshot, IndexStatus, SnapshotPublisher};
use crate::registry::IndexDefinition;
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Catch-up yields to the scheduler and checks for shutdown this often.
const YIELD_EVERY: usize = 256;

/// Why a phase stopped early.
enum Halt {
    Shutdown,
    Failed {
        reason: FailureReason,
        poisoned: Option<Change>,
    },
}

impl Halt {
    fn feed(error: FeedError) -> Self {
        Halt::Failed {
            reason: FailureReason::Feed(error),
            poisoned: None,
        }
    }
}

pub(super) struct Worker {
    definition: Arc<IndexDefinition>,
    feed: Arc<dyn ChangeFeed>,
    config: EngineConfig,
    instance_id: Uuid,
    publisher: SnapshotPublisher,
    commands: mpsc::Receiver<Command>,
    state: Accumulator,
    status: IndexStatus,
    failure: Option<String>,
    version: u64,
    /// Catch-up sequences the operator chose to skip.
    skip: HashSet<Sequence>,
}

impl Worker {
    pub(super) fn new(
        definition: Arc<IndexDefinition>,
        feed: Arc<dyn ChangeFeed>,
        config: EngineConfig,
        instance_id: Uuid,
        publisher: SnapshotPublisher,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let state = Accumulator::new(definition.initial_value.clone());
        Worker {
            definition,
            feed,
            config,
            instance_id,
            publisher,
            commands,
            state,
            status: IndexStatus::Initializing,
            failure: None,
            version: 0,
            skip: HashSet::new(),
        }
    }

    pub(super) async fn run(mut self) {
        tracing::info!(
            index = %self.definition.name,
            resource_type = %self.definition.source_resource_type,
            instance_id = %self.instance_id,
            "index worker started"
        );
        if self.initialize().await {
            self.tail().await;
        }
        tracing::info!(
            index = %self.definition.name,
            instance_id = %self.instance_id,
            sequence = self.state.sequence(),
            "index worker stopped"
        );
    }

    /// Catch up, waiting for operator resume after each failure. False on shutdown.
    async fn initialize(&mut self) -> bool {
        loop {
            match self.catch_up().await {
                Ok(()) => return true,
                Err(Halt::Shutdown) => return false,
                Err(Halt::Failed { reason, poisoned }) => {
                    let Some(policy) = self.await_resume(&reason).await else {
                        return false;
                    };
                    if let (ResumePolicy::Skip, Some(change)) = (policy, poisoned) {
                        self.skip.insert(change.sequence);
                    }
                }
            }
        }
    }

    /// Scan existing records (or replay the log) and fold them into a fresh accumulator. The
    /// previous state stays published until the new one is complete.
    async fn catch_up(&mut self) -> Result<(), Halt> {
        self.set_status(IndexStatus::Initializing);
        let timeout = self.config.catch_up_timeout();
        let deadline = Instant::now() + timeout;
        let timed_out = || Halt::Failed {
            reason: FailureReason::CatchUpTimeout(timeout),
            poisoned: None,
        };

        let feed = self.feed.clone();
        let resource_type = self.definition.source_resource_type.clone();
        let source = self.definition.catch_up_source();
        let policy = RetryPolicy::from(&self.config);
        let scan = tokio::time::timeout_at(deadline, async move {
            scan_with_retry(feed.as_ref(), &resource_type, source, &policy).await
        });
        let catch_up = match self.until_shutdown(scan).await {
            None => return Err(Halt::Shutdown),
            Some(Err(_elapsed)) => return Err(timed_out()),
            Some(Ok(Err(e))) => return Err(Halt::feed(e)),
            Some(Ok(Ok(catch_up))) => catch_up,
        };

        self.set_status(IndexStatus::CatchingUp);
        tracing::debug!(
            index = %self.definition.name,
            ?source,
            changes = catch_up.changes.len(),
            head = catch_up.head,
            "catching up"
        );
        let mut next = Accumulator::new(self.definition.initial_value.clone());
        for (i, change) in catch_up.changes.iter().enumerate() {
            if i > 0 && i % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
                if self.shutdown_requested() {
                    return Err(Halt::Shutdown);
                }
            }
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            next.apply_with(&self.definition, change, &self.skip)
                .map_err(|source| Halt::Failed {
                    reason: FailureReason::Reducer {
                        sequence: change.sequence,
                        source,
                    },
                    poisoned: Some(change.clone()),
                })?;
        }
        next.advance_to(catch_up.head);
        self.state = next;
        tracing::info!(
            index = %self.definition.name,
            changes = catch_up.changes.len(),
            sequence = self.state.sequence(),
            "catch-up complete"
        );
        Ok(())
    }

    async fn tail(&mut self) {
        let mut halt = self.follow().await;
        loop {
            let Halt::Failed { reason, poisoned } = halt else {
                return;
            };
            let Some(policy) = self.await_resume(&reason).await else {
                return;
            };
            halt = match self.recover(&reason, poisoned, policy) {
                Ok(()) => self.follow().await,
                Err(h) => h,
            };
        }
    }

    /// Subscribe after the last applied sequence and fold deliveries until something stops us.
    async fn follow(&mut self) -> Halt {
        let connect = ResilientSubscription::connect(
            self.feed.clone(),
            self.definition.source_resource_type.clone(),
            self.state.sequence(),
            RetryPolicy::from(&self.config),
        );
        let subscription = match self.until_shutdown(connect).await {
            None => return Halt::Shutdown,
            Some(Err(e)) => return Halt::feed(e),
            Some(Ok(subscription)) => subscription,
        };
        let (mut rx, pump) = pump::spawn(
            self.definition.name.clone(),
            Box::new(subscription),
            self.definition.backpressure_policy,
            self.config.queue_capacity,
        );
        self.set_status(IndexStatus::Live);
        tracing::info!(index = %self.definition.name, sequence = self.state.sequence(), "index live");
        let halt = self.consume(&mut rx).await;
        pump.abort();
        halt
    }

    async fn consume(&mut self, rx: &mut mpsc::Receiver<Delivery>) -> Halt {
        let mut paused = false;
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Halt::Shutdown,
                    Some(Command::Pause) if !paused => {
                        paused = true;
                        self.set_status(IndexStatus::Paused);
                        tracing::info!(index = %self.definition.name, sequence = self.state.sequence(), "index paused");
                    }
                    Some(Command::Resume(_)) if paused => {
                        paused = false;
                        self.set_status(IndexStatus::Live);
                        tracing::info!(index = %self.definition.name, "index resumed");
                    }
                    Some(command) => {
                        tracing::debug!(index = %self.definition.name, ?command, "ignoring command");
                    }
                },
                delivery = rx.recv(), if !paused => match delivery {
                    Some(Delivery::Change(change)) => {
                        if let Err(halt) = self.apply_live(change) {
                            return halt;
                        }
                    }
                    Some(Delivery::Dropped(gap)) => {
                        if self.state.skip(gap.from, gap.to, gap.cause) {
                            self.publish();
                        }
                    }
                    Some(Delivery::Failed(e)) => return Halt::feed(e),
                    None => return Halt::feed(FeedError::Closed),
                },
            }
        }
    }

    fn apply_live(&mut self, change: Change) -> Result<(), Halt> {
        let last = self.state.sequence();
        if change.sequence <= last {
            tracing::debug!(
                index = %self.definition.name,
                sequence = change.sequence,
                last_applied = last,
                "discarding redelivered change"
            );
            return Ok(());
        }
        if change.sequence != last + 1 {
            return Err(Halt::feed(FeedError::Gap {
                resource_type: change.resource_type.clone(),
                expected: last + 1,
                found: change.sequence,
            }));
        }
        self.fold(change)?;
        self.publish();
        Ok(())
    }

    fn fold(&mut self, change: Change) -> Result<(), Halt> {
        match self.state.apply(&self.definition, &change) {
            Ok(()) => {
                tracing::debug!(index = %self.definition.name, sequence = change.sequence, "applied change");
                Ok(())
            }
            Err(source) => Err(Halt::Failed {
                reason: FailureReason::Reducer {
                    sequence: change.sequence,
                    source,
                },
                poisoned: Some(change),
            }),
        }
    }

    fn recover(&mut self, reason: &FailureReason, poisoned: Option<Change>, policy: ResumePolicy) -> Result<(), Halt> {
        match (poisoned, policy) {
            (Some(change), ResumePolicy::Retry) => self.fold(change),
            (Some(change), ResumePolicy::Skip) => {
                tracing::warn!(index = %self.definition.name, sequence = change.sequence, "operator skipped change");
                self.state.skip(change.sequence, change.sequence, GapCause::SkippedChange);
                Ok(())
            }
            (None, ResumePolicy::Skip) => {
                if let FailureReason::Feed(FeedError::Gap { expected, found, .. }) = reason {
                    tracing::warn!(
                        index = %self.definition.name,
                        from = expected,
                        to = found - 1,
                        "operator accepted feed gap"
                    );
                    self.state.skip(*expected, found - 1, GapCause::FeedGap);
                }
                Ok(())
            }
            (None, ResumePolicy::Retry) => Ok(()),
        }
    }

    /// Publish the failure and wait for an operator resume. `None` means shut down.
    async fn await_resume(&mut self, reason: &FailureReason) -> Option<ResumePolicy> {
        tracing::error!(
            index = %self.definition.name,
            sequence = self.state.sequence(),
            error = %reason,
            "index failed"
        );
        self.failure = Some(reason.to_string());
        self.set_status(IndexStatus::Failed);
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => return None,
                Some(Command::Resume(policy)) => {
                    tracing::info!(index = %self.definition.name, ?policy, "resuming failed index");
                    self.failure = None;
                    return Some(policy);
                }
                Some(Command::Pause) => {}
            }
        }
    }

    /// Drive `fut` to completion while still answering shutdown.
    async fn until_shutdown<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return None,
                    Some(command) => {
                        tracing::debug!(index = %self.definition.name, ?command, "ignoring command");
                    }
                },
                output = &mut fut => return Some(output),
            }
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => return true,
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Empty) => return false,
            }
        }
    }

    fn set_status(&mut self, status: IndexStatus) {
        self.status = status;
        self.publish();
    }

    fn publish(&mut self) {
        self.version += 1;
        let gaps = self.state.gaps().to_vec();
        self.publisher.publish(IndexSnapshot {
            name: self.definition.name.clone(),
            instance_id: self.instance_id,
            value: self.state.value().clone(),
            sequence: self.state.sequence(),
            status: self.status,
            stale: matches!(self.status, IndexStatus::Failed | IndexStatus::Paused),
            partial: !gaps.is_empty(),
            gaps,
            failure: self.failure.clone(),
            version: self.version,
            as_of: Utc::now(),
        });
    }
}
