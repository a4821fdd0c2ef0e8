use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteExecutor, SqlitePool, types::Json};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Plan not found")]
    NotFound,
    #[error("Task not found")]
    TaskNotFound,
    #[error("Plan version {0} not found")]
    VersionNotFound(i64),
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
pub enum PlanStatus {
    Draft,
    Reviewing,
    Approved,
    Rejected,
}

/// One ordered step of a proposed solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub order: i64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A versioned proposed solution for one task. The newest plan row for a
/// task is the current plan; every semantically significant change bumps
/// `version` and writes a PlanVersion snapshot.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub task_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub steps: Json<Vec<PlanStep>>,
    pub context: Json<Value>,
    pub status: PlanStatus,
    pub version: i64,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlanVersion {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub version: i64,
    pub title: String,
    pub description: Option<String>,
    pub steps: Json<Vec<PlanStep>>,
    pub context: Json<Value>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlan {
    pub task_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub steps: Vec<PlanStep>,
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePlanContent {
    pub title: Option<String>,
    pub description: Option<String>,
    pub steps: Option<Vec<PlanStep>>,
    pub context: Option<Value>,
}

const SELECT_COLS: &str = r#"id, task_id, title, description, steps, context, status, version,
       approved_at, rejected_at, created_at, updated_at, deleted_at"#;

impl Plan {
    /// Create a draft plan at version 1 with its first snapshot.
    pub async fn create(pool: &SqlitePool, data: &CreatePlan, id: Uuid) -> Result<Self, PlanError> {
        if data.title.trim().is_empty() {
            return Err(PlanError::Validation("title must not be empty".into()));
        }
        super::task::Task::find_by_id(pool, data.task_id)
            .await?
            .ok_or(PlanError::TaskNotFound)?;

        let mut tx = pool.begin().await?;
        let now = Utc::now();
        let context = data.context.clone().unwrap_or_else(|| Value::Object(Default::default()));
        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"INSERT INTO plans (id, task_id, title, description, steps, context, status,
                                  version, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, 'draft', 1, $7, $7)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(data.task_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(Json(data.steps.clone()))
        .bind(Json(context))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        Self::snapshot(&mut *tx, &plan).await?;
        tx.commit().await?;

        Ok(plan)
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Plan>(&format!(
            "SELECT {SELECT_COLS} FROM plans WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    /// The current plan for a task is the most recently created live row.
    pub async fn current_for_task(
        executor: impl SqliteExecutor<'_>,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Plan>(&format!(
            r#"SELECT {SELECT_COLS} FROM plans
               WHERE task_id = $1 AND deleted_at IS NULL
               ORDER BY created_at DESC
               LIMIT 1"#
        ))
        .bind(task_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn fetch_for_task(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Plan>(&format!(
            r#"SELECT {SELECT_COLS} FROM plans
               WHERE task_id = $1 AND deleted_at IS NULL
               ORDER BY created_at DESC"#
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    /// Apply a content edit: merge provided fields, bump the version and
    /// snapshot the result.
    pub async fn update_content(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdatePlanContent,
    ) -> Result<Self, PlanError> {
        let mut tx = pool.begin().await?;
        let existing = Self::find_by_id(&mut *tx, id).await?.ok_or(PlanError::NotFound)?;

        let title = data.title.clone().unwrap_or(existing.title);
        let description = data.description.clone().or(existing.description);
        let steps = data.steps.clone().unwrap_or(existing.steps.0);
        let context = data.context.clone().unwrap_or(existing.context.0);

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"UPDATE plans
               SET title = $1, description = $2, steps = $3, context = $4,
                   version = version + 1, updated_at = $5
               WHERE id = $6
               RETURNING {SELECT_COLS}"#
        ))
        .bind(&title)
        .bind(&description)
        .bind(Json(steps))
        .bind(Json(context))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        Self::snapshot(&mut *tx, &plan).await?;
        tx.commit().await?;
        Ok(plan)
    }

    /// Status change with version bump + snapshot, inside the caller's
    /// transaction so the status machine can attach audit rows atomically.
    /// Approval/rejection timestamps are set here so they always match the
    /// status column.
    pub async fn set_status(
        conn: &mut sqlx::SqliteConnection,
        id: Uuid,
        status: PlanStatus,
    ) -> Result<Self, PlanError> {
        Self::find_by_id(&mut *conn, id).await?.ok_or(PlanError::NotFound)?;

        let now = Utc::now();
        let approved_at = (status == PlanStatus::Approved).then_some(now);
        let rejected_at = (status == PlanStatus::Rejected).then_some(now);

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"UPDATE plans
               SET status = $1,
                   approved_at = COALESCE($2, approved_at),
                   rejected_at = COALESCE($3, rejected_at),
                   version = version + 1,
                   updated_at = $4
               WHERE id = $5
               RETURNING {SELECT_COLS}"#
        ))
        .bind(status)
        .bind(approved_at)
        .bind(rejected_at)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

        Self::snapshot(&mut *conn, &plan).await?;
        Ok(plan)
    }

    /// Mark one step done/undone; steps are content, so this versions too.
    pub async fn set_step_completed(
        pool: &SqlitePool,
        id: Uuid,
        step_id: Uuid,
        completed: bool,
    ) -> Result<Self, PlanError> {
        let mut tx = pool.begin().await?;
        let existing = Self::find_by_id(&mut *tx, id).await?.ok_or(PlanError::NotFound)?;

        let mut steps = existing.steps.0;
        let step = steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| PlanError::Validation(format!("step {step_id} not found")))?;
        step.completed = completed;
        step.completed_at = completed.then(Utc::now);

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"UPDATE plans
               SET steps = $1, version = version + 1, updated_at = $2
               WHERE id = $3
               RETURNING {SELECT_COLS}"#
        ))
        .bind(Json(steps))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        Self::snapshot(&mut *tx, &plan).await?;
        tx.commit().await?;
        Ok(plan)
    }

    pub async fn versions(pool: &SqlitePool, plan_id: Uuid) -> Result<Vec<PlanVersion>, sqlx::Error> {
        sqlx::query_as::<_, PlanVersion>(
            r#"SELECT id, plan_id, version, title, description, steps, context, status, created_at
               FROM plan_versions
               WHERE plan_id = $1
               ORDER BY version ASC"#,
        )
        .bind(plan_id)
        .fetch_all(pool)
        .await
    }

    /// Restore the content of `version` as a NEW version (`current + 1`);
    /// version numbers never go backwards or get reused.
    pub async fn rollback(pool: &SqlitePool, id: Uuid, version: i64) -> Result<Self, PlanError> {
        let mut tx = pool.begin().await?;
        Self::find_by_id(&mut *tx, id).await?.ok_or(PlanError::NotFound)?;

        let snapshot = sqlx::query_as::<_, PlanVersion>(
            r#"SELECT id, plan_id, version, title, description, steps, context, status, created_at
               FROM plan_versions
               WHERE plan_id = $1 AND version = $2"#,
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(PlanError::VersionNotFound(version))?;

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"UPDATE plans
               SET title = $1, description = $2, steps = $3, context = $4,
                   version = version + 1, updated_at = $5
               WHERE id = $6
               RETURNING {SELECT_COLS}"#
        ))
        .bind(&snapshot.title)
        .bind(&snapshot.description)
        .bind(&snapshot.steps)
        .bind(&snapshot.context)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        Self::snapshot(&mut *tx, &plan).await?;
        tx.commit().await?;
        Ok(plan)
    }

    async fn snapshot(
        executor: impl SqliteExecutor<'_>,
        plan: &Plan,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO plan_versions (id, plan_id, version, title, description, steps,
                                          context, status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(Uuid::new_v4())
        .bind(plan.id)
        .bind(plan.version)
        .bind(&plan.title)
        .bind(&plan.description)
        .bind(&plan.steps)
        .bind(&plan.context)
        .bind(plan.status)
        .bind(Utc::now())
        .execute(executor)
        .await?;
        Ok(())
    }
}
