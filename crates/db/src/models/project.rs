use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Project not found")]
    NotFound,
    #[error("A project named '{0}' already exists")]
    DuplicateName(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// A tracked source repository. Tasks, worktrees and pull requests all hang
/// off a project; `max_concurrent_tasks` caps parallel implementation work.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub git_repo_url: String,
    pub git_repo_path: String,
    pub default_branch: String,
    pub auto_merge: bool,
    pub require_approval: bool,
    pub max_concurrent_tasks: i64,
    pub planning_timeout_mins: Option<i64>,
    pub implementation_timeout_mins: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub git_repo_url: String,
    pub git_repo_path: String,
    pub default_branch: Option<String>,
    pub auto_merge: Option<bool>,
    pub require_approval: Option<bool>,
    pub max_concurrent_tasks: Option<i64>,
    pub planning_timeout_mins: Option<i64>,
    pub implementation_timeout_mins: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub git_repo_url: Option<String>,
    pub default_branch: Option<String>,
    pub auto_merge: Option<bool>,
    pub require_approval: Option<bool>,
    pub max_concurrent_tasks: Option<i64>,
    pub planning_timeout_mins: Option<i64>,
    pub implementation_timeout_mins: Option<i64>,
}

const SELECT_COLS: &str = r#"id, name, git_repo_url, git_repo_path, default_branch,
       auto_merge, require_approval, max_concurrent_tasks,
       planning_timeout_mins, implementation_timeout_mins,
       created_at, updated_at, deleted_at"#;

impl Project {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        id: Uuid,
    ) -> Result<Self, ProjectError> {
        if data.name.trim().is_empty() {
            return Err(ProjectError::Validation("name must not be empty".into()));
        }
        let max_concurrent = data.max_concurrent_tasks.unwrap_or(3);
        if max_concurrent < 1 {
            return Err(ProjectError::Validation(
                "max_concurrent_tasks must be >= 1".into(),
            ));
        }
        if Self::name_exists(pool, &data.name, None).await? {
            return Err(ProjectError::DuplicateName(data.name.clone()));
        }

        let now = Utc::now();
        let project = sqlx::query_as::<_, Project>(&format!(
            r#"INSERT INTO projects (id, name, git_repo_url, git_repo_path, default_branch,
                                     auto_merge, require_approval, max_concurrent_tasks,
                                     planning_timeout_mins, implementation_timeout_mins,
                                     created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(&data.name)
        .bind(&data.git_repo_url)
        .bind(&data.git_repo_path)
        .bind(data.default_branch.as_deref().unwrap_or("main"))
        .bind(data.auto_merge.unwrap_or(false))
        .bind(data.require_approval.unwrap_or(true))
        .bind(max_concurrent)
        .bind(data.planning_timeout_mins)
        .bind(data.implementation_timeout_mins)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if crate::is_unique_violation(&e) {
                ProjectError::DuplicateName(data.name.clone())
            } else {
                ProjectError::Database(e)
            }
        })?;

        Ok(project)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {SELECT_COLS} FROM projects WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_id_with_deleted(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!("SELECT {SELECT_COLS} FROM projects WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Non-archived projects, newest first.
    pub async fn fetch_all(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(&format!(
            "SELECT {SELECT_COLS} FROM projects WHERE deleted_at IS NULL ORDER BY created_at DESC"
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateProject,
    ) -> Result<Self, ProjectError> {
        let existing = Self::find_by_id(pool, id)
            .await?
            .ok_or(ProjectError::NotFound)?;

        let name = data.name.clone().unwrap_or(existing.name.clone());
        let git_repo_url = data.git_repo_url.clone().unwrap_or(existing.git_repo_url);
        let default_branch = data
            .default_branch
            .clone()
            .unwrap_or(existing.default_branch);
        let auto_merge = data.auto_merge.unwrap_or(existing.auto_merge);
        let require_approval = data.require_approval.unwrap_or(existing.require_approval);
        let max_concurrent = data
            .max_concurrent_tasks
            .unwrap_or(existing.max_concurrent_tasks);
        let planning_timeout = data
            .planning_timeout_mins
            .or(existing.planning_timeout_mins);
        let implementation_timeout = data
            .implementation_timeout_mins
            .or(existing.implementation_timeout_mins);
        if max_concurrent < 1 {
            return Err(ProjectError::Validation(
                "max_concurrent_tasks must be >= 1".into(),
            ));
        }
        if name != existing.name && Self::name_exists(pool, &name, Some(id)).await? {
            return Err(ProjectError::DuplicateName(name));
        }

        let project = sqlx::query_as::<_, Project>(&format!(
            r#"UPDATE projects
               SET name = $1, git_repo_url = $2, default_branch = $3, auto_merge = $4,
                   require_approval = $5, max_concurrent_tasks = $6,
                   planning_timeout_mins = $7, implementation_timeout_mins = $8,
                   updated_at = $9
               WHERE id = $10
               RETURNING {SELECT_COLS}"#
        ))
        .bind(&name)
        .bind(&git_repo_url)
        .bind(&default_branch)
        .bind(auto_merge)
        .bind(require_approval)
        .bind(max_concurrent)
        .bind(planning_timeout)
        .bind(implementation_timeout)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(project)
    }

    /// Soft-delete. Archived projects drop out of ordinary queries but stay
    /// on disk for audit.
    pub async fn archive(pool: &SqlitePool, id: Uuid) -> Result<(), ProjectError> {
        let result = sqlx::query(
            "UPDATE projects SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ProjectError::NotFound);
        }
        Ok(())
    }

    pub async fn restore(pool: &SqlitePool, id: Uuid) -> Result<Self, ProjectError> {
        let archived = Self::find_by_id_with_deleted(pool, id)
            .await?
            .ok_or(ProjectError::NotFound)?;
        if archived.deleted_at.is_none() {
            return Ok(archived);
        }
        if Self::name_exists(pool, &archived.name, Some(id)).await? {
            return Err(ProjectError::DuplicateName(archived.name));
        }

        let project = sqlx::query_as::<_, Project>(&format!(
            r#"UPDATE projects SET deleted_at = NULL, updated_at = $1 WHERE id = $2
               RETURNING {SELECT_COLS}"#
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(project)
    }

    async fn name_exists(
        pool: &SqlitePool,
        name: &str,
        exclude: Option<Uuid>,
    ) -> Result<bool, sqlx::Error> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(
                   SELECT 1 FROM projects
                   WHERE name = $1 AND deleted_at IS NULL AND ($2 IS NULL OR id <> $2)
               )"#,
        )
        .bind(name)
        .bind(exclude)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }
}
