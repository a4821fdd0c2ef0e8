use std::{sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::{
        pull_request::{PullRequest, PullRequestState},
        task::{Task, TaskStatus},
    },
};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    events::{EventBus, topics},
    github::RepoProvider,
    metrics::MetricsService,
    status::StatusService,
    worktree_manager::WorktreeManager,
};

/// Closes the loop from external pull-request state back to task status.
///
/// Open PullRequest rows are polled on a jittered interval; webhook
/// deliveries short-circuit the wait via [`PrMonitorService::refresh`].
pub struct PrMonitorService {
    db: DbService,
    provider: Arc<dyn RepoProvider>,
    status: Arc<StatusService>,
    worktrees: Arc<WorktreeManager>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsService>,
    poll_interval: Duration,
}

impl PrMonitorService {
    pub fn new(
        db: DbService,
        provider: Arc<dyn RepoProvider>,
        status: Arc<StatusService>,
        worktrees: Arc<WorktreeManager>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsService>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            provider,
            status,
            worktrees,
            events,
            metrics,
            poll_interval,
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let sleep_for = self.jittered_interval();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        if let Err(e) = self.poll_once().await {
                            tracing::warn!("PR poll pass failed: {e}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    fn jittered_interval(&self) -> Duration {
        let jitter_cap = (self.poll_interval / 5).max(Duration::from_millis(100));
        let jitter = rand::rng().random_range(Duration::ZERO..jitter_cap);
        self.poll_interval + jitter
    }

    /// One pass over every open pull request.
    pub async fn poll_once(&self) -> Result<(), sqlx::Error> {
        let open = PullRequest::find_open(&self.db.pool).await?;
        for pr in open {
            if let Err(e) = self.refresh_row(&pr).await {
                tracing::warn!("failed to refresh PR {}#{}: {e}", pr.repository, pr.number);
            }
        }
        Ok(())
    }

    /// Webhook entry point: refresh the named PR immediately instead of
    /// waiting for the next poll. Unknown PRs are ignored.
    pub async fn refresh(&self, repository: &str, number: i64) -> Result<bool, sqlx::Error> {
        match PullRequest::find_by_repo_and_number(&self.db.pool, repository, number).await? {
            Some(pr) if pr.state == PullRequestState::Open => {
                if let Err(e) = self.refresh_row(&pr).await {
                    tracing::warn!("webhook refresh failed for {repository}#{number}: {e}");
                }
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn refresh_row(&self, pr: &PullRequest) -> anyhow::Result<()> {
        let info = self
            .provider
            .get_pull_request(&pr.repository, pr.number)
            .await?;

        match info.state {
            PullRequestState::Open => Ok(()),
            PullRequestState::Merged => self.handle_merged(pr, info.merged_at).await,
            PullRequestState::Closed => self.handle_closed_unmerged(pr).await,
        }
    }

    async fn handle_merged(
        &self,
        pr: &PullRequest,
        merged_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> anyhow::Result<()> {
        let merged_at = merged_at.unwrap_or_else(chrono::Utc::now);
        PullRequest::update_state(
            &self.db.pool,
            pr.id,
            PullRequestState::Merged,
            Some(merged_at),
        )
        .await?;
        self.metrics.incr("pull_request.merged");
        self.events.publish(
            &topics::pull_request(pr.id),
            "pullrequest.merged",
            serde_json::json!({ "pull_request_id": pr.id, "number": pr.number }),
        );

        // advance the task; a task someone already moved is just logged
        match Task::find_by_id(&self.db.pool, pr.task_id).await? {
            Some(task) if task.status == TaskStatus::CodeReviewing => {
                self.status
                    .transition_task(task.id, TaskStatus::Done, None, Some("pull request merged"))
                    .await?;
                self.destroy_worktrees(task.id).await;
            }
            Some(task) => {
                tracing::warn!(
                    "PR #{} merged but task {} is in '{}', leaving it alone",
                    pr.number,
                    task.id,
                    task.status
                );
            }
            None => {
                tracing::warn!("PR #{} merged but its task is gone", pr.number);
            }
        }
        Ok(())
    }

    async fn handle_closed_unmerged(&self, pr: &PullRequest) -> anyhow::Result<()> {
        PullRequest::update_state(&self.db.pool, pr.id, PullRequestState::Closed, None).await?;
        self.metrics.incr("pull_request.closed_unmerged");
        // the task stays in code_reviewing; a human decides what happens next
        self.events.publish(
            &topics::pull_request(pr.id),
            "pullrequest.closed_unmerged",
            serde_json::json!({
                "pull_request_id": pr.id,
                "task_id": pr.task_id,
                "number": pr.number,
            }),
        );
        Ok(())
    }

    async fn destroy_worktrees(&self, task_id: Uuid) {
        if let Err(e) = self.worktrees.destroy_for_task(task_id).await {
            tracing::warn!("failed to destroy worktrees for task {task_id}: {e}");
        }
    }
}
