use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor};
use uuid::Uuid;

/// Append-only audit trail. One row per state-changing command; `actor` is
/// None for system-initiated changes (monitors, sweeps, recovery).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub actor: Option<String>,
    pub operation: String,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub entity_type: &'a str,
    pub entity_id: Uuid,
    pub actor: Option<&'a str>,
    pub operation: &'a str,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub reason: Option<&'a str>,
}

impl AuditLog {
    pub async fn append(
        executor: impl SqliteExecutor<'_>,
        entry: AuditEntry<'_>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO audit_logs (id, entity_type, entity_id, actor, operation,
                                       from_state, to_state, reason, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.entity_type)
        .bind(entry.entity_id)
        .bind(entry.actor)
        .bind(entry.operation)
        .bind(entry.from_state)
        .bind(entry.to_state)
        .bind(entry.reason)
        .bind(Utc::now())
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn fetch_for_entity(
        executor: impl SqliteExecutor<'_>,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AuditLog>(
            r#"SELECT id, entity_type, entity_id, actor, operation, from_state, to_state, reason, created_at
               FROM audit_logs
               WHERE entity_type = $1 AND entity_id = $2
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(executor)
        .await
    }
}
