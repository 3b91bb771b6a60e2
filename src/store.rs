//! Postgres change log DDL and appends. The table lives in a schema named from `MATERIALIZE_SCHEMA`
//! env (default `materialize`) and is written by the storage layer in the same transaction as
//! the primary record.

use crate::change::{Change, Operation, Sequence};
use crate::error::AppError;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

/// Schema name for the change log. From env `MATERIALIZE_SCHEMA`, default `materialize`. Must be a valid PostgreSQL identifier.
pub fn materialize_schema() -> String {
    std::env::var("MATERIALIZE_SCHEMA").unwrap_or_else(|_| "materialize".into())
}

/// Returns schema-qualified table name (e.g. "materialize._sys_changes").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", materialize_schema(), table)
}

pub const CHANGE_LOG_TABLE: &str = "_sys_changes";

/// Create the schema and change log table if they do not exist.
/// Sequences are per resource type; (resource_type, sequence) is the primary key.
pub async fn ensure_change_log(pool: &PgPool) -> Result<(), AppError> {
    let schema = materialize_schema();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    let q_table = qualified_sys_table(CHANGE_LOG_TABLE);
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            resource_type TEXT NOT NULL,
            sequence BIGINT NOT NULL,
            operation TEXT NOT NULL,
            record_key TEXT NOT NULL,
            before JSONB,
            after JSONB,
            committed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (resource_type, sequence)
        )
        "#,
        q_table
    );
    sqlx::query(&ddl).execute(pool).await?;

    let key_index = format!(
        "CREATE INDEX IF NOT EXISTS {}_record_key_idx ON {} (resource_type, record_key, sequence DESC)",
        CHANGE_LOG_TABLE, q_table
    );
    sqlx::query(&key_index).execute(pool).await?;
    Ok(())
}

/// Append one change inside the caller's transaction. The per-resource-type advisory lock
/// serializes writers so sequences stay gapless; it is released at commit.
pub async fn append_change(
    conn: &mut PgConnection,
    resource_type: &str,
    operation: Operation,
    record_key: &str,
    before: Option<Value>,
    after: Option<Value>,
) -> Result<Change, AppError> {
    let q_table = qualified_sys_table(CHANGE_LOG_TABLE);
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(resource_type)
        .execute(&mut *conn)
        .await?;

    let sql = format!(
        r#"
        INSERT INTO {table} (resource_type, sequence, operation, record_key, before, after)
        SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, $4, $5
        FROM {table} WHERE resource_type = $1
        RETURNING sequence
        "#,
        table = q_table
    );
    tracing::debug!(sql = %sql, resource_type, operation = %operation, "append change");
    let sequence: i64 = sqlx::query_scalar(&sql)
        .bind(resource_type)
        .bind(operation.as_str())
        .bind(record_key)
        .bind(&before)
        .bind(&after)
        .fetch_one(&mut *conn)
        .await?;

    Ok(Change {
        resource_type: resource_type.to_string(),
        operation,
        before,
        after,
        sequence: sequence as Sequence,
    })
}
