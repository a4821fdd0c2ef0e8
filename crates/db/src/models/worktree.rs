use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor, SqlitePool};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorktreeRowError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Worktree not found")]
    NotFound,
    #[error("Branch '{0}' is already in use by another worktree")]
    DuplicateBranch(String),
    #[error("Path '{0}' is already in use by another worktree")]
    DuplicatePath(String),
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
pub enum WorktreeStatus {
    Creating,
    Active,
    Completed,
    Error,
    Inactive,
}

/// An isolated working copy of the project repository tied to one task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Worktree {
    pub id: Uuid,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub branch: String,
    pub path: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const SELECT_COLS: &str =
    "id, task_id, project_id, branch, path, status, created_at, updated_at, deleted_at";

impl Worktree {
    /// Reserve the (branch, path) pair with a `creating` row. The partial
    /// unique indexes back the duplicate checks under concurrency.
    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        task_id: Uuid,
        project_id: Uuid,
        branch: &str,
        path: &str,
    ) -> Result<Self, WorktreeRowError> {
        if Self::branch_in_use(pool, project_id, branch).await? {
            return Err(WorktreeRowError::DuplicateBranch(branch.to_string()));
        }
        if Self::path_in_use(pool, path).await? {
            return Err(WorktreeRowError::DuplicatePath(path.to_string()));
        }

        let now = Utc::now();
        sqlx::query_as::<_, Worktree>(&format!(
            r#"INSERT INTO worktrees (id, task_id, project_id, branch, path, status,
                                      created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, 'creating', $6, $6)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(task_id)
        .bind(project_id)
        .bind(branch)
        .bind(path)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if crate::is_unique_violation(&e) {
                WorktreeRowError::DuplicateBranch(branch.to_string())
            } else {
                WorktreeRowError::Database(e)
            }
        })
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Worktree>(&format!(
            "SELECT {SELECT_COLS} FROM worktrees WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_task(
        executor: impl SqliteExecutor<'_>,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Worktree>(&format!(
            r#"SELECT {SELECT_COLS} FROM worktrees
               WHERE task_id = $1 AND deleted_at IS NULL
               ORDER BY created_at DESC"#
        ))
        .bind(task_id)
        .fetch_all(executor)
        .await
    }

    pub async fn fetch_all(
        pool: &SqlitePool,
        project_id: Option<Uuid>,
        status: Option<WorktreeStatus>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Worktree>(&format!(
            r#"SELECT {SELECT_COLS} FROM worktrees
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

    pub async fn update_status(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        status: WorktreeStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE worktrees SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn soft_delete(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE worktrees SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Worktrees eligible for the background sweep: completed or errored,
    /// untouched for longer than `retention`.
    pub async fn find_reclaimable(
        pool: &SqlitePool,
        retention: Duration,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let cutoff = Utc::now() - retention;
        sqlx::query_as::<_, Worktree>(&format!(
            r#"SELECT {SELECT_COLS} FROM worktrees
               WHERE status IN ('completed', 'error') AND updated_at < $1 AND deleted_at IS NULL
               ORDER BY updated_at ASC"#
        ))
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }

    pub async fn branch_in_use(
        pool: &SqlitePool,
        project_id: Uuid,
        branch: &str,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT EXISTS(
                   SELECT 1 FROM worktrees
                   WHERE project_id = $1 AND branch = $2
                     AND status <> 'completed' AND deleted_at IS NULL
               )"#,
        )
        .bind(project_id)
        .bind(branch)
        .fetch_one(pool)
        .await
    }

    pub async fn path_in_use(pool: &SqlitePool, path: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            r#"SELECT EXISTS(
                   SELECT 1 FROM worktrees
                   WHERE path = $1 AND status <> 'completed' AND deleted_at IS NULL
               )"#,
        )
        .bind(path)
        .fetch_one(pool)
        .await
    }
}
