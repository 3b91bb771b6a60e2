//! Change feed over the Postgres change log written by [`crate::store::append_change`].
//! Tailing polls the log; connection errors surface as transient disconnects.

use super::{CatchUp, ChangeFeed, ChangeSubscription};
use crate::bridge::{check_emit, ChangeSink};
use crate::change::{record_key, Change, Operation, Sequence};
use crate::error::{AppError, FeedError};
use crate::store::{append_change, qualified_sys_table, CHANGE_LOG_TABLE};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_BATCH_SIZE: i64 = 500;

type ChangeRow = (i64, String, Option<Value>, Option<Value>);

#[derive(Clone, Debug)]
pub struct PgChangeFeed {
    pool: PgPool,
    poll_interval: Duration,
    batch_size: i64,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool) -> Self {
        PgChangeFeed {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

fn disconnected(e: sqlx::Error) -> FeedError {
    FeedError::Disconnected(e.to_string())
}

fn row_to_change(resource_type: &str, row: ChangeRow) -> Result<Change, FeedError> {
    let (sequence, operation, before, after) = row;
    let operation: Operation = operation.parse().map_err(FeedError::Backend)?;
    let change = Change {
        resource_type: resource_type.to_string(),
        operation,
        before,
        after,
        sequence: sequence as Sequence,
    };
    change.check_shape().map_err(FeedError::Backend)?;
    Ok(change)
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn scan_existing(&self, resource_type: &str) -> Result<CatchUp, FeedError> {
        let q_table = qualified_sys_table(CHANGE_LOG_TABLE);
        let mut tx = self.pool.begin().await.map_err(disconnected)?;
        // Head and record state must come from one snapshot.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(disconnected)?;

        let head_sql = format!(
            "SELECT COALESCE(MAX(sequence), 0) FROM {} WHERE resource_type = $1",
            q_table
        );
        let head: i64 = sqlx::query_scalar(&head_sql)
            .bind(resource_type)
            .fetch_one(&mut *tx)
            .await
            .map_err(disconnected)?;

        let latest_sql = format!(
            r#"
            SELECT sequence, operation, after FROM (
                SELECT DISTINCT ON (record_key) sequence, operation, after
                FROM {} WHERE resource_type = $1 AND sequence <= $2
                ORDER BY record_key, sequence DESC
            ) latest
            WHERE operation <> 'delete'
            ORDER BY sequence
            "#,
            q_table
        );
        tracing::debug!(sql = %latest_sql, resource_type, head, "scan existing");
        let rows: Vec<(i64, String, Option<Value>)> = sqlx::query_as(&latest_sql)
            .bind(resource_type)
            .bind(head)
            .fetch_all(&mut *tx)
            .await
            .map_err(disconnected)?;
        tx.commit().await.map_err(disconnected)?;

        let mut changes = Vec::with_capacity(rows.len());
        for (sequence, _operation, after) in rows {
            let after = after.ok_or_else(|| {
                FeedError::Backend(format!("change {} on '{}' has no after record", sequence, resource_type))
            })?;
            changes.push(Change::create(resource_type, after, sequence as Sequence));
        }
        Ok(CatchUp {
            changes,
            head: head as Sequence,
        })
    }

    async fn replay_log(&self, resource_type: &str) -> Result<CatchUp, FeedError> {
        let sql = format!(
            "SELECT sequence, operation, before, after FROM {} WHERE resource_type = $1 ORDER BY sequence",
            qualified_sys_table(CHANGE_LOG_TABLE)
        );
        tracing::debug!(sql = %sql, resource_type, "replay change log");
        let rows: Vec<ChangeRow> = sqlx::query_as(&sql)
            .bind(resource_type)
            .fetch_all(&self.pool)
            .await
            .map_err(disconnected)?;
        let changes = rows
            .into_iter()
            .map(|row| row_to_change(resource_type, row))
            .collect::<Result<Vec<_>, _>>()?;
        let head = changes.last().map_or(0, |c| c.sequence);
        Ok(CatchUp { changes, head })
    }

    async fn subscribe(
        &self,
        resource_type: &str,
        after: Sequence,
    ) -> Result<Box<dyn ChangeSubscription>, FeedError> {
        // Fail fast when the database is unreachable so the caller backs off.
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(disconnected)?;
        Ok(Box::new(PgSubscription {
            feed: self.clone(),
            resource_type: resource_type.to_string(),
            cursor: after,
            buffer: VecDeque::new(),
        }))
    }
}

struct PgSubscription {
    feed: PgChangeFeed,
    resource_type: String,
    cursor: Sequence,
    buffer: VecDeque<Change>,
}

impl PgSubscription {
    async fn fetch(&self) -> Result<Vec<Change>, FeedError> {
        let sql = format!(
            "SELECT sequence, operation, before, after FROM {} WHERE resource_type = $1 AND sequence > $2 ORDER BY sequence LIMIT $3",
            qualified_sys_table(CHANGE_LOG_TABLE)
        );
        let rows: Vec<ChangeRow> = sqlx::query_as(&sql)
            .bind(&self.resource_type)
            .bind(self.cursor as i64)
            .bind(self.feed.batch_size)
            .fetch_all(&self.feed.pool)
            .await
            .map_err(disconnected)?;
        rows.into_iter()
            .map(|row| row_to_change(&self.resource_type, row))
            .collect()
    }
}

#[async_trait]
impl ChangeSubscription for PgSubscription {
    async fn next(&mut self) -> Result<Change, FeedError> {
        loop {
            if let Some(change) = self.buffer.pop_front() {
                self.cursor = change.sequence;
                return Ok(change);
            }
            let batch = self.fetch().await?;
            if batch.is_empty() {
                tokio::time::sleep(self.feed.poll_interval).await;
            } else {
                self.buffer.extend(batch);
            }
        }
    }
}

/// Bridge sink that appends to the Postgres change log in its own transaction.
/// Storage layers that write records themselves should call [`append_change`] inside their transaction instead.
#[derive(Clone, Debug)]
pub struct PgChangeSink {
    pool: PgPool,
    key_field: String,
}

impl PgChangeSink {
    pub fn new(pool: PgPool, key_field: impl Into<String>) -> Self {
        PgChangeSink {
            pool,
            key_field: key_field.into(),
        }
    }
}

#[async_trait]
impl ChangeSink for PgChangeSink {
    async fn emit(
        &self,
        resource_type: &str,
        operation: Operation,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Result<Change, FeedError> {
        check_emit(resource_type, operation, &before, &after)?;
        let key = after
            .as_ref()
            .or(before.as_ref())
            .and_then(|r| record_key(r, &self.key_field))
            .ok_or_else(|| FeedError::InvalidChange(format!("record has no '{}' key", self.key_field)))?;
        // Catch-up resolves current records by key; a re-keyed update would leave the old key behind.
        if let (Some(old), Operation::Update) = (before.as_ref(), operation) {
            if record_key(old, &self.key_field).as_deref() != Some(key.as_str()) {
                return Err(FeedError::InvalidChange(format!(
                    "update may not change '{}'",
                    self.key_field
                )));
            }
        }
        let mut tx = self.pool.begin().await.map_err(disconnected)?;
        let change = append_change(&mut tx, resource_type, operation, &key, before, after)
            .await
            .map_err(|e| match e {
                AppError::Db(db) => disconnected(db),
                other => FeedError::Backend(other.to_string()),
            })?;
        tx.commit().await.map_err(disconnected)?;
        Ok(change)
    }
}
