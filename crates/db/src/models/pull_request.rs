use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor, SqlitePool};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

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
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

/// External pull request tracked for a task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: Uuid,
    pub task_id: Uuid,
    pub number: i64,
    pub repository: String,
    pub title: String,
    pub body: Option<String>,
    pub head_branch: String,
    pub base_branch: String,
    pub url: String,
    pub state: PullRequestState,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreatePullRequest<'a> {
    pub task_id: Uuid,
    pub number: i64,
    pub repository: &'a str,
    pub title: &'a str,
    pub body: Option<&'a str>,
    pub head_branch: &'a str,
    pub base_branch: &'a str,
    pub url: &'a str,
}

const SELECT_COLS: &str = r#"id, task_id, number, repository, title, body, head_branch,
       base_branch, url, state, merged_at, created_at, updated_at, deleted_at"#;

impl PullRequest {
    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        data: &CreatePullRequest<'_>,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, PullRequest>(&format!(
            r#"INSERT INTO pull_requests (id, task_id, number, repository, title, body,
                                          head_branch, base_branch, url, state,
                                          created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'open', $10, $10)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(data.task_id)
        .bind(data.number)
        .bind(data.repository)
        .bind(data.title)
        .bind(data.body)
        .bind(data.head_branch)
        .bind(data.base_branch)
        .bind(data.url)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, PullRequest>(&format!(
            "SELECT {SELECT_COLS} FROM pull_requests WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_task(
        executor: impl SqliteExecutor<'_>,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, PullRequest>(&format!(
            r#"SELECT {SELECT_COLS} FROM pull_requests
               WHERE task_id = $1 AND deleted_at IS NULL
               ORDER BY created_at DESC
               LIMIT 1"#
        ))
        .bind(task_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_repo_and_number(
        pool: &SqlitePool,
        repository: &str,
        number: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, PullRequest>(&format!(
            r#"SELECT {SELECT_COLS} FROM pull_requests
               WHERE repository = $1 AND number = $2 AND deleted_at IS NULL
               ORDER BY created_at DESC
               LIMIT 1"#
        ))
        .bind(repository)
        .bind(number)
        .fetch_optional(pool)
        .await
    }

    /// The monitor's working set.
    pub async fn find_open(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PullRequest>(&format!(
            r#"SELECT {SELECT_COLS} FROM pull_requests
               WHERE state = 'open' AND deleted_at IS NULL
               ORDER BY created_at ASC"#
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn update_state(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        state: PullRequestState,
        merged_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE pull_requests
               SET state = $1, merged_at = COALESCE($2, merged_at), updated_at = $3
               WHERE id = $4"#,
        )
        .bind(state)
        .bind(merged_at)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }
}
