use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqliteExecutor, SqlitePool, types::Json};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use super::project::Project;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Task not found")]
    NotFound,
    #[error("Project not found")]
    ProjectNotFound,
    #[error("A task titled '{0}' already exists in this project")]
    DuplicateTitle(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Planning,
    PlanReviewing,
    Implementing,
    CodeReviewing,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    /// Statuses that count against a project's concurrency cap.
    pub fn occupies_slot(self) -> bool {
        matches!(self, TaskStatus::Implementing | TaskStatus::CodeReviewing)
    }
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
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub parent_task_id: Option<Uuid>,
    pub tags: Json<Vec<String>>,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub parent_task_id: Option<Uuid>,
    pub tags: Option<Vec<String>>,
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub tags: Option<Vec<String>>,
    pub assignee: Option<String>,
}

/// Task listing row enriched with execution state, the shape the board UI
/// polls for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWithExecutionStatus {
    #[serde(flatten)]
    pub task: Task,
    pub has_in_progress_execution: bool,
    pub last_execution_failed: bool,
    pub execution_count: i64,
}

const SELECT_COLS: &str = r#"id, project_id, title, description, priority, status,
       parent_task_id, tags, assignee, created_at, updated_at, deleted_at"#;

impl Task {
    pub async fn create(pool: &SqlitePool, data: &CreateTask, id: Uuid) -> Result<Self, TaskError> {
        if data.title.trim().is_empty() {
            return Err(TaskError::Validation("title must not be empty".into()));
        }
        Project::find_by_id(pool, data.project_id)
            .await?
            .ok_or(TaskError::ProjectNotFound)?;
        if let Some(parent) = data.parent_task_id {
            Self::find_by_id(pool, parent)
                .await?
                .ok_or(TaskError::Validation("parent task does not exist".into()))?;
        }
        if Self::title_exists(pool, data.project_id, &data.title).await? {
            return Err(TaskError::DuplicateTitle(data.title.clone()));
        }

        let now = Utc::now();
        let task = sqlx::query_as::<_, Task>(&format!(
            r#"INSERT INTO tasks (id, project_id, title, description, priority, status,
                                  parent_task_id, tags, assignee, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, 'todo', $6, $7, $8, $9, $9)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(data.project_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.priority.unwrap_or(TaskPriority::Medium))
        .bind(data.parent_task_id)
        .bind(Json(data.tags.clone().unwrap_or_default()))
        .bind(&data.assignee)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if crate::is_unique_violation(&e) {
                TaskError::DuplicateTitle(data.title.clone())
            } else {
                TaskError::Database(e)
            }
        })?;

        Ok(task)
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {SELECT_COLS} FROM tasks WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_id_with_deleted(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!("SELECT {SELECT_COLS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn fetch_all(
        pool: &SqlitePool,
        project_id: Option<Uuid>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            r#"SELECT {SELECT_COLS} FROM tasks
               WHERE deleted_at IS NULL
                 AND ($1 IS NULL OR project_id = $1)
                 AND ($2 IS NULL OR status = $2)
               ORDER BY created_at DESC"#
        ))
        .bind(project_id)
        .bind(status)
        .fetch_all(pool)
        .await
    }

    /// Listing with execution flags, one query instead of N+1.
    pub async fn fetch_all_with_status(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<TaskWithExecutionStatus>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"SELECT {SELECT_COLS},

              CASE WHEN EXISTS (
                SELECT 1 FROM executions e
                 WHERE e.task_id = tasks.id
                   AND e.status IN ('pending', 'running', 'paused')
                   AND e.deleted_at IS NULL
                 LIMIT 1
              ) THEN 1 ELSE 0 END AS has_in_progress_execution,

              CASE WHEN (
                SELECT e.status FROM executions e
                 WHERE e.task_id = tasks.id AND e.deleted_at IS NULL
                 ORDER BY e.created_at DESC
                 LIMIT 1
              ) = 'failed' THEN 1 ELSE 0 END AS last_execution_failed,

              ( SELECT COUNT(*) FROM executions e
                 WHERE e.task_id = tasks.id AND e.deleted_at IS NULL
              ) AS execution_count

            FROM tasks
            WHERE project_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC"#
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let task = Task::from_row(&row)?;
            let has_in_progress = row.try_get::<i64, _>("has_in_progress_execution")? != 0;
            let last_failed = row.try_get::<i64, _>("last_execution_failed")? != 0;
            let execution_count: i64 = row.try_get("execution_count")?;
            items.push(TaskWithExecutionStatus {
                task,
                has_in_progress_execution: has_in_progress,
                last_execution_failed: last_failed,
                execution_count,
            });
        }
        Ok(items)
    }

    /// Field-level merge is done by the caller; this writes the whole row.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        title: String,
        description: Option<String>,
        priority: TaskPriority,
        tags: Vec<String>,
        assignee: Option<String>,
    ) -> Result<Self, TaskError> {
        let existing = Self::find_by_id(pool, id).await?.ok_or(TaskError::NotFound)?;
        if title != existing.title && Self::title_exists(pool, existing.project_id, &title).await? {
            return Err(TaskError::DuplicateTitle(title));
        }

        let task = sqlx::query_as::<_, Task>(&format!(
            r#"UPDATE tasks
               SET title = $1, description = $2, priority = $3, tags = $4,
                   assignee = $5, updated_at = $6
               WHERE id = $7
               RETURNING {SELECT_COLS}"#
        ))
        .bind(&title)
        .bind(&description)
        .bind(priority)
        .bind(Json(tags))
        .bind(&assignee)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(task)
    }

    /// Raw status write. Only the status machine calls this; everything else
    /// goes through `services::status` so history and audit stay consistent.
    pub async fn update_status(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn soft_delete(pool: &SqlitePool, id: Uuid) -> Result<(), TaskError> {
        let result = sqlx::query(
            "UPDATE tasks SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TaskError::NotFound);
        }
        Ok(())
    }

    /// Hard delete; FK cascade removes plans, executions, logs, worktree and
    /// pull-request rows.
    pub async fn delete(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    /// Tasks holding a concurrency slot for the project right now.
    pub async fn count_active_for_project(
        executor: impl SqliteExecutor<'_>,
        project_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM tasks
               WHERE project_id = $1
                 AND status IN ('implementing', 'code_reviewing')
                 AND deleted_at IS NULL"#,
        )
        .bind(project_id)
        .fetch_one(executor)
        .await
    }

    pub async fn parent_project(&self, pool: &SqlitePool) -> Result<Option<Project>, sqlx::Error> {
        Project::find_by_id(pool, self.project_id).await
    }

    async fn title_exists(
        pool: &SqlitePool,
        project_id: Uuid,
        title: &str,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT EXISTS(
                   SELECT 1 FROM tasks
                   WHERE project_id = $1 AND title = $2 AND deleted_at IS NULL
               )"#,
        )
        .bind(project_id)
        .bind(title)
        .fetch_one(pool)
        .await
    }
}
