use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor};
use uuid::Uuid;

use super::task::TaskStatus;

/// Append-only record of task status transitions.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskStatusHistory {
    pub id: Uuid,
    pub task_id: Uuid,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskStatusHistory {
    pub async fn append(
        executor: impl SqliteExecutor<'_>,
        task_id: Uuid,
        from_status: TaskStatus,
        to_status: TaskStatus,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO task_status_history (id, task_id, from_status, to_status, actor, reason, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(from_status)
        .bind(to_status)
        .bind(actor)
        .bind(reason)
        .bind(Utc::now())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Oldest first, so the rows replay the task's lifecycle in order.
    pub async fn fetch_for_task(
        executor: impl SqliteExecutor<'_>,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, TaskStatusHistory>(
            r#"SELECT id, task_id, from_status, to_status, actor, reason, created_at
               FROM task_status_history
               WHERE task_id = $1
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(task_id)
        .fetch_all(executor)
        .await
    }
}
