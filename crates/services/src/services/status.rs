use std::sync::Arc;

use autodev_db::{
    DbService,
    models::{
        audit_log::{AuditEntry, AuditLog},
        plan::{Plan, PlanError, PlanStatus},
        task::{Task, TaskStatus},
        task_status_history::TaskStatusHistory,
    },
};
use thiserror::Error;
use uuid::Uuid;

use super::{
    events::{EventBus, topics},
    metrics::MetricsService,
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Task not found")]
    TaskNotFound,
    #[error("Plan not found")]
    PlanNotFound,
    #[error("Invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },
}

impl From<PlanError> for StatusError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::NotFound => StatusError::PlanNotFound,
            PlanError::TaskNotFound => StatusError::TaskNotFound,
            PlanError::Database(e) => StatusError::Database(e),
            other => StatusError::InvalidTransition {
                from: "plan".to_string(),
                to: other.to_string(),
            },
        }
    }
}

/// Legal task edges. The reject path (plan_reviewing -> planning) and the
/// dispatcher's failure returns (planning -> todo, implementing ->
/// plan_reviewing) are part of the graph; cancellation is reachable from
/// every non-terminal state.
pub fn task_edge_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if to == Cancelled {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Todo, Planning)
            | (Planning, PlanReviewing)
            | (Planning, Todo)
            | (PlanReviewing, Implementing)
            | (PlanReviewing, Planning)
            | (Implementing, CodeReviewing)
            | (Implementing, PlanReviewing)
            | (CodeReviewing, Done)
    )
}

pub fn plan_edge_allowed(from: PlanStatus, to: PlanStatus) -> bool {
    use PlanStatus::*;
    matches!(
        (from, to),
        (Draft, Reviewing) | (Reviewing, Approved) | (Reviewing, Rejected) | (Rejected, Draft)
    )
}

/// Authoritative transition kernel for Task and Plan. Every status write
/// re-reads current state, validates the edge, updates the row, appends
/// history and audit, and publishes, inside one transaction. Nothing else
/// in the engine touches status columns.
pub struct StatusService {
    db: DbService,
    events: Arc<EventBus>,
    metrics: Arc<MetricsService>,
}

impl StatusService {
    pub fn new(db: DbService, events: Arc<EventBus>, metrics: Arc<MetricsService>) -> Self {
        Self {
            db,
            events,
            metrics,
        }
    }

    pub async fn transition_task(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Task, StatusError> {
        let mut tx = self.db.pool.begin().await?;

        let task = Task::find_by_id(&mut *tx, task_id)
            .await?
            .ok_or(StatusError::TaskNotFound)?;
        let from = task.status;
        if !task_edge_allowed(from, to) {
            return Err(StatusError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        Task::update_status(&mut *tx, task_id, to).await?;
        TaskStatusHistory::append(&mut *tx, task_id, from, to, actor, reason).await?;
        AuditLog::append(
            &mut *tx,
            AuditEntry {
                entity_type: "task",
                entity_id: task_id,
                actor,
                operation: "status_transition",
                from_state: Some(from.to_string()),
                to_state: Some(to.to_string()),
                reason,
            },
        )
        .await?;

        let updated = Task::find_by_id(&mut *tx, task_id)
            .await?
            .ok_or(StatusError::TaskNotFound)?;
        tx.commit().await?;

        self.metrics.incr("task.status_transition");
        let payload = serde_json::json!({
            "task": updated,
            "from": from,
            "to": to,
        });
        self.events.publish(
            &topics::task(task_id),
            "task.status_changed",
            payload.clone(),
        );
        self.events.publish(
            &topics::task_project(updated.project_id),
            "task.status_changed",
            payload,
        );

        Ok(updated)
    }

    /// All-or-nothing bulk variant: every edge is validated against current
    /// state before any row changes, so one invalid member aborts the batch.
    pub async fn transition_tasks_bulk(
        &self,
        task_ids: &[Uuid],
        to: TaskStatus,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Vec<Task>, StatusError> {
        let mut tx = self.db.pool.begin().await?;

        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let task = Task::find_by_id(&mut *tx, *task_id)
                .await?
                .ok_or(StatusError::TaskNotFound)?;
            if !task_edge_allowed(task.status, to) {
                return Err(StatusError::InvalidTransition {
                    from: task.status.to_string(),
                    to: to.to_string(),
                });
            }
            tasks.push(task);
        }

        let mut updated = Vec::with_capacity(tasks.len());
        for task in &tasks {
            Task::update_status(&mut *tx, task.id, to).await?;
            TaskStatusHistory::append(&mut *tx, task.id, task.status, to, actor, reason).await?;
            AuditLog::append(
                &mut *tx,
                AuditEntry {
                    entity_type: "task",
                    entity_id: task.id,
                    actor,
                    operation: "status_transition",
                    from_state: Some(task.status.to_string()),
                    to_state: Some(to.to_string()),
                    reason,
                },
            )
            .await?;
            let task = Task::find_by_id(&mut *tx, task.id)
                .await?
                .ok_or(StatusError::TaskNotFound)?;
            updated.push(task);
        }
        tx.commit().await?;

        for task in &updated {
            self.metrics.incr("task.status_transition");
            let payload = serde_json::json!({ "task": task, "to": to });
            self.events
                .publish(&topics::task(task.id), "task.status_changed", payload.clone());
            self.events.publish(
                &topics::task_project(task.project_id),
                "task.status_changed",
                payload,
            );
        }
        Ok(updated)
    }

    pub async fn transition_plan(
        &self,
        plan_id: Uuid,
        to: PlanStatus,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Plan, StatusError> {
        let mut tx = self.db.pool.begin().await?;

        let plan = Plan::find_by_id(&mut *tx, plan_id)
            .await?
            .ok_or(StatusError::PlanNotFound)?;
        let from = plan.status;
        if !plan_edge_allowed(from, to) {
            return Err(StatusError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let updated = Plan::set_status(&mut *tx, plan_id, to).await?;
        AuditLog::append(
            &mut *tx,
            AuditEntry {
                entity_type: "plan",
                entity_id: plan_id,
                actor,
                operation: "status_transition",
                from_state: Some(from.to_string()),
                to_state: Some(to.to_string()),
                reason,
            },
        )
        .await?;
        tx.commit().await?;

        self.metrics.incr("plan.status_transition");
        self.events.publish(
            &topics::plan(plan_id),
            "plan.status_changed",
            serde_json::json!({ "plan": updated, "from": from, "to": to }),
        );

        Ok(updated)
    }
}
