use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor, SqlitePool, types::Json};
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
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Killed,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Stopped | ProcessStatus::Killed | ProcessStatus::Error
        )
    }
}

/// A child OS process backing an execution. The row is written before the
/// spawn so a crash between insert and exec leaves an auditable `starting`
/// row rather than nothing.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionProcess {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub pid: Option<i64>,
    pub command: String,
    pub args: Json<Vec<String>>,
    pub working_dir: String,
    pub env: Json<HashMap<String, String>>,
    pub status: ProcessStatus,
    pub exit_code: Option<i64>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const SELECT_COLS: &str = r#"id, execution_id, pid, command, args, working_dir, env, status,
       exit_code, cpu_usage, memory_usage, started_at, ended_at,
       created_at, updated_at, deleted_at"#;

impl ExecutionProcess {
    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        execution_id: Uuid,
        command: &str,
        args: &[String],
        working_dir: &str,
        env: &HashMap<String, String>,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, ExecutionProcess>(&format!(
            r#"INSERT INTO execution_processes (id, execution_id, command, args, working_dir,
                                                env, status, started_at, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, 'starting', $7, $7, $7)
               RETURNING {SELECT_COLS}"#
        ))
        .bind(id)
        .bind(execution_id)
        .bind(command)
        .bind(Json(args.to_vec()))
        .bind(working_dir)
        .bind(Json(env.clone()))
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(&format!(
            "SELECT {SELECT_COLS} FROM execution_processes WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_execution(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(&format!(
            r#"SELECT {SELECT_COLS} FROM execution_processes
               WHERE execution_id = $1 AND deleted_at IS NULL
               ORDER BY created_at ASC"#
        ))
        .bind(execution_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_running(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionProcess>(&format!(
            r#"SELECT {SELECT_COLS} FROM execution_processes
               WHERE status IN ('starting', 'running') AND deleted_at IS NULL"#
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn mark_running(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        pid: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE execution_processes SET status = 'running', pid = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(pid)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn update_resources(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        cpu_usage: f64,
        memory_usage: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE execution_processes
               SET cpu_usage = $1, memory_usage = $2, updated_at = $3
               WHERE id = $4"#,
        )
        .bind(cpu_usage)
        .bind(memory_usage)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn finish(
        executor: impl SqliteExecutor<'_>,
        id: Uuid,
        status: ProcessStatus,
        exit_code: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE execution_processes
               SET status = $1, exit_code = $2, ended_at = $3, updated_at = $3
               WHERE id = $4"#,
        )
        .bind(status)
        .bind(exit_code)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }
}
