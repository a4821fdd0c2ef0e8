use std::{path::PathBuf, sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::{
        project::Project,
        task::Task,
        worktree::{Worktree, WorktreeRowError, WorktreeStatus},
    },
};
use autodev_utils::branch::{short_id, slugify, task_branch_name};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::git::{GitCli, GitError, GitService};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Row(#[from] WorktreeRowError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Worktree not found")]
    NotFound,
}

/// Creates and reclaims per-task working copies.
///
/// Creation is serialized per project: git mutates shared repository state
/// (refs, worktree metadata) and concurrent checkouts in the same repo
/// corrupt it. Creates across projects run in parallel.
pub struct WorktreeManager {
    db: DbService,
    git: GitService,
    git_cli: GitCli,
    base_dir: PathBuf,
    project_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WorktreeManager {
    pub fn new(db: DbService, base_dir: PathBuf) -> Self {
        Self {
            db,
            git: GitService::new(),
            git_cli: GitCli::new(),
            base_dir,
            project_locks: DashMap::new(),
        }
    }

    fn project_lock(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        self.project_locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Checkout the project default branch into a fresh directory and
    /// create the task branch off it. The row passes creating -> active;
    /// any failure leaves it in `error` with the path released.
    pub async fn create(&self, project: &Project, task: &Task) -> Result<Worktree, WorktreeError> {
        let lock = self.project_lock(project.id);
        let _guard = lock.lock().await;

        let repo_path = PathBuf::from(&project.git_repo_path);
        self.git
            .ensure_branch_exists(&repo_path, &project.default_branch)?;

        let branch = task_branch_name(&task.id, &task.title);
        let path = self.allocate_path(project, task).await?;
        let path_str = path.display().to_string();

        let worktree = Worktree::create(
            &self.db.pool,
            Uuid::new_v4(),
            task.id,
            project.id,
            &branch,
            &path_str,
        )
        .await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self
            .git_cli
            .worktree_add(&repo_path, &path, &branch, &project.default_branch)
            .await
        {
            Ok(()) => {
                Worktree::update_status(&self.db.pool, worktree.id, WorktreeStatus::Active).await?;
                let worktree = Worktree::find_by_id(&self.db.pool, worktree.id)
                    .await?
                    .ok_or(WorktreeError::NotFound)?;
                tracing::info!(
                    worktree_id = %worktree.id,
                    branch = %branch,
                    path = %path_str,
                    "created worktree"
                );
                Ok(worktree)
            }
            Err(e) => {
                tracing::error!("worktree add failed for task {}: {e}", task.id);
                Worktree::update_status(&self.db.pool, worktree.id, WorktreeStatus::Error).await?;
                // release the path reservation so a retry can reuse it
                Worktree::soft_delete(&self.db.pool, worktree.id).await?;
                Err(e.into())
            }
        }
    }

    /// Remove the working copy from disk and retire the row
    /// (status=inactive, soft-deleted). Idempotent for already-gone trees.
    pub async fn destroy(&self, worktree_id: Uuid) -> Result<(), WorktreeError> {
        let worktree = Worktree::find_by_id(&self.db.pool, worktree_id)
            .await?
            .ok_or(WorktreeError::NotFound)?;
        let project = Project::find_by_id(&self.db.pool, worktree.project_id).await?;

        if let Some(project) = project {
            let repo_path = PathBuf::from(&project.git_repo_path);
            let tree_path = PathBuf::from(&worktree.path);
            if let Err(e) = self.git_cli.worktree_remove(&repo_path, &tree_path).await {
                tracing::warn!("failed to remove worktree {}: {e}", worktree.id);
            }
        }

        Worktree::update_status(&self.db.pool, worktree.id, WorktreeStatus::Inactive).await?;
        Worktree::soft_delete(&self.db.pool, worktree.id).await?;
        tracing::info!(worktree_id = %worktree_id, "destroyed worktree");
        Ok(())
    }

    /// Destroy every live worktree of a task (cascade-delete hook).
    pub async fn destroy_for_task(&self, task_id: Uuid) -> Result<usize, WorktreeError> {
        let worktrees = Worktree::find_by_task(&self.db.pool, task_id).await?;
        let count = worktrees.len();
        for worktree in worktrees {
            self.destroy(worktree.id).await?;
        }
        Ok(count)
    }

    pub async fn mark_error(&self, worktree_id: Uuid) -> Result<(), WorktreeError> {
        Worktree::update_status(&self.db.pool, worktree_id, WorktreeStatus::Error).await?;
        Ok(())
    }

    pub async fn mark_completed(&self, worktree_id: Uuid) -> Result<(), WorktreeError> {
        Worktree::update_status(&self.db.pool, worktree_id, WorktreeStatus::Completed).await?;
        Ok(())
    }

    /// One pass of the reclaim sweep: completed/errored worktrees older
    /// than `retention` are destroyed.
    pub async fn sweep_once(&self, retention: Duration) -> Result<usize, WorktreeError> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let stale = Worktree::find_reclaimable(&self.db.pool, retention).await?;
        let mut reclaimed = 0;
        for worktree in stale {
            match self.destroy(worktree.id).await {
                Ok(()) => reclaimed += 1,
                Err(e) => tracing::warn!("sweep failed to reclaim {}: {e}", worktree.id),
            }
        }
        Ok(reclaimed)
    }

    /// Background sweep worker; exits on cancellation.
    pub fn spawn_sweep(
        self: Arc<Self>,
        interval: Duration,
        retention: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once(retention).await {
                            Ok(0) => {}
                            Ok(n) => tracing::info!("worktree sweep reclaimed {n} trees"),
                            Err(e) => tracing::warn!("worktree sweep failed: {e}"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// A path unique among live worktrees AND absent on disk.
    async fn allocate_path(&self, project: &Project, task: &Task) -> Result<PathBuf, WorktreeError> {
        let project_slug = slugify(&project.name, 24);
        let base = self.base_dir.join(project_slug);
        let stem = format!("{}-{}", short_id(&task.id), slugify(&task.title, 24));

        for attempt in 0..16 {
            let candidate = if attempt == 0 {
                base.join(&stem)
            } else {
                base.join(format!("{stem}-{attempt}"))
            };
            let candidate_str = candidate.display().to_string();
            if candidate.exists() {
                continue;
            }
            if !Worktree::path_in_use(&self.db.pool, &candidate_str).await? {
                return Ok(candidate);
            }
        }
        Err(WorktreeError::Io(std::io::Error::other(
            "could not allocate a unique worktree path",
        )))
    }
}
