use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, types::Json};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Upsert chunk size; SQLite's bind-parameter ceiling comfortably allows
/// 100 rows x 8 columns.
pub const BATCH_CHUNK_SIZE: usize = 100;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

/// One line of agent output, unique per (execution, line).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub line: i64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub metadata: Option<Json<Value>>,
    pub logged_at: DateTime<Utc>,
}

/// Input shape for the batch upsert; the pipeline builds these without ids
/// because the (execution_id, line) key decides insert vs update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: Uuid,
    pub line: i64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub metadata: Option<Value>,
    pub logged_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// Insert-or-update on (execution_id, line), in chunks of
    /// [`BATCH_CHUNK_SIZE`] rows per statement. Re-delivery of a line
    /// replaces the stored row instead of duplicating it.
    pub async fn batch_upsert(pool: &SqlitePool, entries: &[LogEntry]) -> Result<(), sqlx::Error> {
        for chunk in entries.chunks(BATCH_CHUNK_SIZE) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO execution_logs (id, execution_id, line, level, source, message, metadata, logged_at) ",
            );
            qb.push_values(chunk, |mut b, entry| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(entry.execution_id)
                    .push_bind(entry.line)
                    .push_bind(entry.level)
                    .push_bind(entry.source)
                    .push_bind(&entry.message)
                    .push_bind(entry.metadata.clone().map(Json))
                    .push_bind(entry.logged_at);
            });
            qb.push(
                r#" ON CONFLICT (execution_id, line) DO UPDATE SET
                        level = excluded.level,
                        source = excluded.source,
                        message = excluded.message,
                        metadata = excluded.metadata,
                        logged_at = excluded.logged_at"#,
            );
            qb.build().execute(pool).await?;
        }
        Ok(())
    }

    /// Lines for an execution in line order, optionally only after a cursor.
    pub async fn fetch_for_execution(
        pool: &SqlitePool,
        execution_id: Uuid,
        after_line: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionLog>(
            r#"SELECT id, execution_id, line, level, source, message, metadata, logged_at
               FROM execution_logs
               WHERE execution_id = $1 AND ($2 IS NULL OR line > $2)
               ORDER BY line ASC
               LIMIT $3"#,
        )
        .bind(execution_id)
        .bind(after_line)
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await
    }

    pub async fn count_for_execution(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM execution_logs WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_one(pool)
            .await
    }

    pub async fn max_line_for_execution(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COALESCE(MAX(line), 0) FROM execution_logs WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(pool)
        .await
    }

    /// Rotation: keep only the newest `keep` lines for the execution.
    pub async fn rotate(
        pool: &SqlitePool,
        execution_id: Uuid,
        keep: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"DELETE FROM execution_logs
               WHERE execution_id = $1
                 AND line NOT IN (
                     SELECT line FROM execution_logs
                     WHERE execution_id = $1
                     ORDER BY line DESC
                     LIMIT $2
                 )"#,
        )
        .bind(execution_id)
        .bind(keep)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Retention sweep for logs whose execution is still retained.
    pub async fn delete_older_than(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE logged_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
