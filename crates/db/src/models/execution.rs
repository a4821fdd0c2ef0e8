use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteExecutor, SqlitePool, types::Json};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Execution not found")]
    NotFound,
    #[error("Task not found")]
    TaskNotFound,
    #[error("Task already has an execution in flight")]
    AlreadyActive,
    #[error("Validation error: {0}")]
    Validation(String),
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
pub enum ExecutionType {
    Planning,
    Implementation,
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
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One invocation of an AI agent for a task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub exec_type: ExecutionType,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub error: Option<String>,
    pub result: Option<Json<Value>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const SELECT_COLS: &str = r#"id, task_id, exec_type, status, progress, error, result,
       started_at, completed_at, created_at, updated_at, deleted_at"#;

impl Execution {
    /// Insert a new running execution. The partial unique index on
    /// (task_id, active statuses) makes concurrent creates race-safe: the
    /// loser gets `AlreadyActive`.
    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        task_id: Uuid,
        exec_type: ExecutionType,
    ) -> Result<Self, ExecutionError> {
        super::task::Task::find_by_id(pool, task_id)
            .await?
            .ok_or(ExecutionError::TaskNotFound)?;

        let now = Utc::now();
        sqlx::query_as::<_, Execution>(&format!(
            r#"INSERT INTO executions (id, task_id, exec_type, status, progress,
                                       started_at, created_at, updated_at)
               VALUES ($1, $2, $3, 'running', 0.0, $4, $4, $4)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(task_id)
        .bind(exec_type)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if crate::is_unique_violation(&e) {
                ExecutionError::AlreadyActive
            } else {
                ExecutionError::Database(e)
            }
        })
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            "SELECT {SELECT_COLS} FROM executions WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_active_for_task(
        executor: impl SqliteExecutor<'_>,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            r#"SELECT {SELECT_COLS} FROM executions
               WHERE task_id = $1
                 AND status IN ('pending', 'running', 'paused')
                 AND deleted_at IS NULL"#
        ))
        .bind(task_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn fetch_all(
        pool: &SqlitePool,
        task_id: Option<Uuid>,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            r#"SELECT {SELECT_COLS} FROM executions
               WHERE deleted_at IS NULL
                 AND ($1 IS NULL OR task_id = $1)
                 AND ($2 IS NULL OR status = $2)
               ORDER BY created_at DESC"#
        ))
        .bind(task_id)
        .bind(status)
        .fetch_all(pool)
        .await
    }

    /// Executions a previous engine run left in flight; reconciled at boot.
    pub async fn find_running(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            r#"SELECT {SELECT_COLS} FROM executions
               WHERE status IN ('pending', 'running', 'paused') AND deleted_at IS NULL"#
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn update_status(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let completed_at = status.is_terminal().then_some(now);
        sqlx::query(
            r#"UPDATE executions
               SET status = $1, completed_at = COALESCE($2, completed_at), updated_at = $3
               WHERE id = $4"#,
        )
        .bind(status)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn update_progress(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        progress: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE executions SET progress = $1, updated_at = $2 WHERE id = $3")
            .bind(progress.clamp(0.0, 1.0))
            .bind(Utc::now())
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn complete(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        result: Option<Value>,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE executions
               SET status = 'completed', progress = 1.0, result = $1,
                   completed_at = $2, updated_at = $2
               WHERE id = $3"#,
        )
        .bind(result.map(Json))
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn fail(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE executions
               SET status = 'failed', error = $1, completed_at = $2, updated_at = $2
               WHERE id = $3"#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn soft_delete(pool: &SqlitePool, id: Uuid) -> Result<(), ExecutionError> {
        let result = sqlx::query(
            "UPDATE executions SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ExecutionError::NotFound);
        }
        Ok(())
    }

    /// Retention sweep: hard-delete finished executions older than the
    /// cutoff. FK cascade takes processes and logs with them.
    pub async fn cleanup_older_than(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"DELETE FROM executions
               WHERE created_at < $1
                 AND status IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
