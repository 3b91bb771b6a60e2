//! Index engine: one worker task per registered index.
//!
//! A worker scans existing records, folds them, then tails the live feed through a bounded
//! queue. Folding for one index is strictly serial; workers never share state, so a failing
//! reducer freezes only its own index.

mod accumulator;
mod pump;
mod worker;

pub use accumulator::Accumulator;

use crate::config::EngineConfig;
use crate::error::AppError;
use crate::feed::ChangeFeed;
use crate::materialized::SnapshotPublisher;
use crate::registry::IndexDefinition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 16;

/// How a failed index continues after operator resume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Re-apply the poisoned change, or restart the failed phase.
    #[default]
    Retry,
    /// Step over the poisoned change or missing sequences and flag the index partial.
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Pause,
    Resume(ResumePolicy),
    Shutdown,
}

/// Control side of a running worker, held by the registry.
#[derive(Debug)]
pub struct WorkerHandle {
    instance_id: Uuid,
    commands: mpsc::Sender<Command>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), AppError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::Conflict("index worker is busy".into()),
            mpsc::error::TrySendError::Closed(_) => AppError::Conflict("index worker has stopped".into()),
        })
    }

    /// Ask the worker to stop at the next fold boundary and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.join.await {
            tracing::error!(instance_id = %self.instance_id, error = %e, "index worker did not exit cleanly");
        }
    }
}

/// Start the worker for one index instance. Must be called inside a tokio runtime.
pub fn spawn(
    definition: Arc<IndexDefinition>,
    feed: Arc<dyn ChangeFeed>,
    config: EngineConfig,
    instance_id: Uuid,
    publisher: SnapshotPublisher,
) -> WorkerHandle {
    let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
    let worker = worker::Worker::new(definition, feed, config, instance_id, publisher, rx);
    let join = tokio::spawn(worker.run());
    WorkerHandle {
        instance_id,
        commands,
        join,
    }
}
