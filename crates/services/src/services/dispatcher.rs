use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::{
        audit_log::{AuditEntry, AuditLog},
        execution::{Execution, ExecutionError, ExecutionStatus, ExecutionType},
        execution_process::{ExecutionProcess, ProcessStatus},
        plan::{CreatePlan, Plan, PlanStatus, PlanStep},
        project::Project,
        pull_request::{CreatePullRequest, PullRequest},
        task::{Task, TaskStatus},
        worktree::Worktree,
    },
};
use autodev_executors::{
    protocol::{AgentEvent, AgentTaskDescriptor, PlanOutput, PlanStepOutput},
    spawn::SpawnSpec,
};
use autodev_utils::text::tail_summary;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    config::Config,
    events::{EventBus, topics},
    github::{CreatePrRequest, ProviderError, RepoProvider, parse_repository},
    log_pipeline::{LogPipeline, PipelineSummary},
    metrics::MetricsService,
    status::{StatusError, StatusService},
    supervisor::{ProcessLimits, ProcessOutcome, ProcessSupervisor, SupervisorError},
    worktree_manager::{WorktreeError, WorktreeManager},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Task not found")]
    TaskNotFound,
    #[error("Project not found")]
    ProjectNotFound,
    #[error("Execution not found")]
    ExecutionNotFound,
    #[error("No plan found for task")]
    PlanNotFound,
    #[error("Project {project_id} is at its concurrency limit ({limit})")]
    CapacityExhausted { project_id: Uuid, limit: i64 },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// What a cancellation should do to the owning task once the process dies:
/// a task-scoped cancel ends the task, an execution-scoped cancel returns
/// it to its pre-execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelScope {
    ExecutionOnly,
    Task,
}

struct RunningExecution {
    scope: Arc<std::sync::Mutex<CancelScope>>,
    finished: watch::Receiver<bool>,
}

/// Admission-controlled scheduler for planning and implementation runs.
///
/// Planning starts are never admission-controlled; implementation starts
/// count `implementing + code_reviewing` tasks against the project's
/// `max_concurrent_tasks` under a per-project mutex, so concurrent start
/// requests cannot oversubscribe a project.
pub struct Dispatcher {
    db: DbService,
    config: Arc<Config>,
    events: Arc<EventBus>,
    status: Arc<StatusService>,
    supervisor: Arc<ProcessSupervisor>,
    worktrees: Arc<WorktreeManager>,
    provider: Arc<dyn RepoProvider>,
    pipeline: Arc<LogPipeline>,
    metrics: Arc<MetricsService>,
    admission_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    running: DashMap<Uuid, RunningExecution>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbService,
        config: Arc<Config>,
        events: Arc<EventBus>,
        status: Arc<StatusService>,
        supervisor: Arc<ProcessSupervisor>,
        worktrees: Arc<WorktreeManager>,
        provider: Arc<dyn RepoProvider>,
        pipeline: Arc<LogPipeline>,
        metrics: Arc<MetricsService>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            events,
            status,
            supervisor,
            worktrees,
            provider,
            pipeline,
            metrics,
            admission_locks: DashMap::new(),
            running: DashMap::new(),
            shutdown,
        })
    }

    fn admission_lock(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        self.admission_locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_task_and_project(
        &self,
        task_id: Uuid,
    ) -> Result<(Task, Project), DispatchError> {
        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(DispatchError::TaskNotFound)?;
        let project = task
            .parent_project(&self.db.pool)
            .await?
            .ok_or(DispatchError::ProjectNotFound)?;
        Ok((task, project))
    }

    /// Task `todo -> planning`: spawn the planner agent and stream its
    /// output. Returns the created execution; the run itself is driven in
    /// the background.
    pub async fn start_planning(
        self: &Arc<Self>,
        task_id: Uuid,
        actor: Option<String>,
    ) -> Result<Execution, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let (task, project) = self.load_task_and_project(task_id).await?;

        self.status
            .transition_task(task_id, TaskStatus::Planning, actor.as_deref(), None)
            .await?;

        let execution =
            match Execution::create(&self.db.pool, Uuid::new_v4(), task_id, ExecutionType::Planning)
                .await
            {
                Ok(execution) => execution,
                Err(e) => {
                    let _ = self
                        .status
                        .transition_task(
                            task_id,
                            TaskStatus::Todo,
                            None,
                            Some("failed to create execution"),
                        )
                        .await;
                    return Err(e.into());
                }
            };
        self.publish_execution(&execution, "execution.started");
        self.metrics.incr("execution.planning.started");

        let descriptor = AgentTaskDescriptor {
            task_id,
            title: task.title.clone(),
            description: task.description.clone(),
            repository_url: project.git_repo_url.clone(),
            base_branch: project.default_branch.clone(),
            plan: None,
        };
        let spec = self.agent_spec(
            &self.config.ai_planner_command,
            PathBuf::from(&project.git_repo_path),
            &descriptor,
        )?;

        let wall_clock = project
            .planning_timeout_mins
            .map(|mins| Duration::from_secs(mins as u64 * 60))
            .unwrap_or(self.config.planning_timeout);
        let limits = ProcessLimits {
            wall_clock: Some(wall_clock),
            memory_bytes: None,
        };
        self.launch(execution, spec, limits, LaunchKind::Planning)
            .await
    }

    /// Plan approved, task `plan_reviewing -> implementing`, under the
    /// project concurrency cap. Creates the worktree, spawns the
    /// implementer and drives it to a pull request.
    pub async fn start_implementation(
        self: &Arc<Self>,
        task_id: Uuid,
        actor: Option<String>,
    ) -> Result<Execution, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let (task, project) = self.load_task_and_project(task_id).await?;

        let plan = Plan::current_for_task(&self.db.pool, task_id)
            .await?
            .ok_or(DispatchError::PlanNotFound)?;
        // projects with require_approval=false only block rejected plans
        let approved_enough = if project.require_approval {
            plan.status == PlanStatus::Approved
        } else {
            plan.status != PlanStatus::Rejected
        };
        if !approved_enough {
            return Err(DispatchError::Validation(format!(
                "current plan is '{}', not approved",
                plan.status
            )));
        }

        // admission: check-and-transition under the project mutex so
        // concurrent starts serialize against the cap
        {
            let lock = self.admission_lock(project.id);
            let _guard = lock.lock().await;
            let active = Task::count_active_for_project(&self.db.pool, project.id).await?;
            if active >= project.max_concurrent_tasks {
                self.metrics.incr("dispatcher.rejected");
                return Err(DispatchError::CapacityExhausted {
                    project_id: project.id,
                    limit: project.max_concurrent_tasks,
                });
            }
            self.status
                .transition_task(task_id, TaskStatus::Implementing, actor.as_deref(), None)
                .await?;
            self.metrics.incr("dispatcher.admitted");
        }

        let worktree = match self.worktrees.create(&project, &task).await {
            Ok(worktree) => worktree,
            Err(e) => {
                let _ = self
                    .status
                    .transition_task(
                        task_id,
                        TaskStatus::PlanReviewing,
                        None,
                        Some("worktree creation failed"),
                    )
                    .await;
                return Err(e.into());
            }
        };

        let execution = match Execution::create(
            &self.db.pool,
            Uuid::new_v4(),
            task_id,
            ExecutionType::Implementation,
        )
        .await
        {
            Ok(execution) => execution,
            Err(e) => {
                let _ = self.worktrees.destroy(worktree.id).await;
                let _ = self
                    .status
                    .transition_task(
                        task_id,
                        TaskStatus::PlanReviewing,
                        None,
                        Some("failed to create execution"),
                    )
                    .await;
                return Err(e.into());
            }
        };
        self.publish_execution(&execution, "execution.started");
        self.metrics.incr("execution.implementation.started");

        let descriptor = AgentTaskDescriptor {
            task_id,
            title: task.title.clone(),
            description: task.description.clone(),
            repository_url: project.git_repo_url.clone(),
            base_branch: project.default_branch.clone(),
            plan: Some(plan_to_output(&plan)),
        };
        let spec = self.agent_spec(
            &self.config.ai_implementer_command,
            PathBuf::from(&worktree.path),
            &descriptor,
        )?;

        let wall_clock = project
            .implementation_timeout_mins
            .map(|mins| Duration::from_secs(mins as u64 * 60))
            .unwrap_or(self.config.implementation_timeout);
        let limits = ProcessLimits {
            wall_clock: Some(wall_clock),
            memory_bytes: None,
        };
        self.launch(
            execution,
            spec,
            limits,
            LaunchKind::Implementation {
                project: Box::new(project),
                task: Box::new(task),
                worktree: Box::new(worktree),
            },
        )
        .await
    }

    fn agent_spec(
        &self,
        command_line: &str,
        cwd: PathBuf,
        descriptor: &AgentTaskDescriptor,
    ) -> Result<SpawnSpec, DispatchError> {
        let payload = serde_json::to_string(descriptor)
            .map_err(|e| DispatchError::Validation(format!("descriptor serialization: {e}")))?;
        SpawnSpec::from_command_line(command_line, cwd, HashMap::new(), Some(payload + "\n"))
            .map_err(|e| DispatchError::Supervisor(SupervisorError::Spawn(e)))
    }

    /// Spawn under supervision, attach the log pipeline and hand the run to
    /// a background driver. On spawn failure the execution fails in place
    /// and the task returns to its pre-execution status.
    async fn launch(
        self: &Arc<Self>,
        execution: Execution,
        spec: SpawnSpec,
        limits: ProcessLimits,
        kind: LaunchKind,
    ) -> Result<Execution, DispatchError> {
        let execution_id = execution.id;
        let mut supervised = match self
            .supervisor
            .spawn_supervised(execution_id, spec, limits)
            .await
        {
            Ok(supervised) => supervised,
            Err(e) => {
                let message = format!("spawn failed: {e}");
                self.finalize_failure(&execution, &kind, &message).await;
                return Err(e.into());
            }
        };

        let output = supervised
            .take_output()
            .unwrap_or_else(|| mpsc::channel(1).1);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let pipeline_handle = self.pipeline.spawn(execution_id, output, Some(progress_tx));

        let scope = Arc::new(std::sync::Mutex::new(CancelScope::ExecutionOnly));
        let (finished_tx, finished_rx) = watch::channel(false);
        self.running.insert(
            execution_id,
            RunningExecution {
                scope: scope.clone(),
                finished: finished_rx,
            },
        );

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher
                .drive(
                    execution,
                    kind,
                    supervised,
                    pipeline_handle,
                    progress_rx,
                    scope,
                )
                .await;
            let _ = finished_tx.send(true);
        });

        let execution = Execution::find_by_id(&self.db.pool, execution_id)
            .await?
            .ok_or(DispatchError::ExecutionNotFound)?;
        Ok(execution)
    }

    /// Follow one run to its end and write the aftermath.
    async fn drive(
        self: Arc<Self>,
        execution: Execution,
        kind: LaunchKind,
        mut supervised: super::supervisor::SupervisedProcess,
        pipeline_handle: tokio::task::JoinHandle<PipelineSummary>,
        mut progress_rx: mpsc::UnboundedReceiver<AgentEvent>,
        scope: Arc<std::sync::Mutex<CancelScope>>,
    ) {
        let execution_id = execution.id;
        let started = std::time::Instant::now();

        // progress consumer: persists tokens as they stream by
        let progress_task = {
            let db = self.db.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                while let Some(event) = progress_rx.recv().await {
                    if let AgentEvent::Progress(progress) = event {
                        if let Err(e) =
                            Execution::update_progress(&db.pool, execution_id, progress).await
                        {
                            tracing::warn!("failed to persist progress: {e}");
                        }
                        events.publish(
                            &topics::execution(execution_id),
                            "execution.progress",
                            serde_json::json!({
                                "execution_id": execution_id,
                                "progress": progress,
                            }),
                        );
                    }
                }
            })
        };

        let outcome = supervised.wait().await;
        let summary = pipeline_handle.await.unwrap_or_default();
        let _ = progress_task.await;

        let result = match outcome {
            ProcessOutcome::Exited { code: 0 } => {
                self.handle_success(&execution, &kind, &summary).await
            }
            ProcessOutcome::Exited { code } => {
                let stderr = tail_summary(&summary.stderr_tail, 10, 2000);
                let message = if stderr.is_empty() {
                    format!("agent exited with code {code}")
                } else {
                    format!("agent exited with code {code}: {stderr}")
                };
                self.finalize_failure(&execution, &kind, &message).await;
                Ok(())
            }
            ProcessOutcome::TimedOut => {
                self.finalize_failure(&execution, &kind, "timeout").await;
                Ok(())
            }
            ProcessOutcome::OomKilled => {
                self.finalize_failure(&execution, &kind, "oom").await;
                Ok(())
            }
            ProcessOutcome::Cancelled => {
                let scope = *scope.lock().unwrap_or_else(|e| e.into_inner());
                self.finalize_cancelled(&execution, &kind, scope).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::error!("driver for execution {execution_id} failed: {e:#}");
            // do not leave the row in-flight forever
            let _ = Execution::fail(
                &self.db.pool,
                execution_id,
                &format!("internal error: {e}"),
            )
            .await;
        }

        if let Err(e) = autodev_db::models::execution_log::ExecutionLog::rotate(
            &self.db.pool,
            execution_id,
            self.config.max_logs_per_execution,
        )
        .await
        {
            tracing::warn!("log rotation failed for {execution_id}: {e}");
        }

        let exec_type = execution.exec_type.to_string();
        self.metrics
            .record_execution_duration(&exec_type, started.elapsed());
        self.supervisor.release(execution_id);
        self.running.remove(&execution_id);
    }

    async fn handle_success(
        &self,
        execution: &Execution,
        kind: &LaunchKind,
        summary: &PipelineSummary,
    ) -> anyhow::Result<()> {
        match kind {
            LaunchKind::Planning => {
                let Some(plan_output) = &summary.plan else {
                    self.finalize_failure(
                        execution,
                        kind,
                        "planner exited 0 without a plan envelope",
                    )
                    .await;
                    return Ok(());
                };

                let plan = Plan::create(
                    &self.db.pool,
                    &CreatePlan {
                        task_id: execution.task_id,
                        title: plan_output.title.clone(),
                        description: plan_output.description.clone(),
                        steps: output_to_steps(&plan_output.steps),
                        context: plan_output.context.clone(),
                    },
                    Uuid::new_v4(),
                )
                .await?;

                Execution::complete(
                    &self.db.pool,
                    execution.id,
                    Some(serde_json::json!({ "plan": plan_output })),
                )
                .await?;
                self.audit_execution(execution, "completed", None).await;
                self.status
                    .transition_task(
                        execution.task_id,
                        TaskStatus::PlanReviewing,
                        None,
                        Some("planner produced a plan"),
                    )
                    .await?;

                self.events.publish(
                    &topics::plan(plan.id),
                    "plan.created",
                    serde_json::json!({ "plan": plan }),
                );
                self.publish_execution_id(execution.id, "execution.completed");
                self.metrics.incr("execution.planning.completed");
            }
            LaunchKind::Implementation {
                project,
                task,
                worktree,
            } => {
                let repository = parse_repository(&project.git_repo_url)
                    .map(|(owner, name)| format!("{owner}/{name}"))
                    .unwrap_or_else(|_| project.git_repo_url.clone());
                let body = task.description.clone();
                let request = CreatePrRequest {
                    repository: repository.clone(),
                    title: task.title.clone(),
                    body,
                    head_branch: worktree.branch.clone(),
                    base_branch: project.default_branch.clone(),
                };

                let info = match self.provider.create_pull_request(&request).await {
                    Ok(info) => info,
                    Err(e) => {
                        self.finalize_failure(
                            execution,
                            kind,
                            &format!("failed to open pull request: {e}"),
                        )
                        .await;
                        return Ok(());
                    }
                };

                let pr = PullRequest::create(
                    &self.db.pool,
                    Uuid::new_v4(),
                    &CreatePullRequest {
                        task_id: execution.task_id,
                        number: info.number,
                        repository: &repository,
                        title: &request.title,
                        body: request.body.as_deref(),
                        head_branch: &request.head_branch,
                        base_branch: &request.base_branch,
                        url: &info.url,
                    },
                )
                .await?;

                Execution::complete(
                    &self.db.pool,
                    execution.id,
                    Some(serde_json::json!({ "pull_request": pr.number, "url": pr.url })),
                )
                .await?;
                self.audit_execution(execution, "completed", None).await;
                self.status
                    .transition_task(
                        execution.task_id,
                        TaskStatus::CodeReviewing,
                        None,
                        Some("implementation finished, pull request opened"),
                    )
                    .await?;

                self.events.publish(
                    &topics::pull_request(pr.id),
                    "pullrequest.opened",
                    serde_json::json!({ "pull_request": pr }),
                );
                self.publish_execution_id(execution.id, "execution.completed");
                self.metrics.incr("execution.implementation.completed");
            }
        }
        Ok(())
    }

    /// Execution fails; the task returns to its pre-execution status and,
    /// for implementation runs, the worktree is kept (status=error) for
    /// post-mortem until the sweep reclaims it.
    async fn finalize_failure(&self, execution: &Execution, kind: &LaunchKind, message: &str) {
        let category = super::failure::classify(message);
        tracing::warn!(
            execution_id = %execution.id,
            %category,
            "execution failed: {message}"
        );
        if let Err(e) = Execution::fail(&self.db.pool, execution.id, message).await {
            tracing::error!("failed to mark execution failed: {e}");
        }
        self.audit_execution(execution, "failed", Some(message)).await;

        let (return_status, note) = match kind {
            LaunchKind::Planning => (TaskStatus::Todo, "planning failed"),
            LaunchKind::Implementation { worktree, .. } => {
                if let Err(e) = self.worktrees.mark_error(worktree.id).await {
                    tracing::warn!("failed to mark worktree errored: {e}");
                }
                (TaskStatus::PlanReviewing, "implementation failed")
            }
        };
        if let Err(e) = self
            .status
            .transition_task(execution.task_id, return_status, None, Some(note))
            .await
        {
            tracing::warn!("failed to return task after failure: {e}");
        }
        self.publish_execution_id(execution.id, "execution.failed");
        self.metrics.incr("execution.failed");
    }

    async fn finalize_cancelled(
        &self,
        execution: &Execution,
        kind: &LaunchKind,
        scope: CancelScope,
    ) {
        if let Err(e) =
            Execution::update_status(&self.db.pool, execution.id, ExecutionStatus::Cancelled).await
        {
            tracing::error!("failed to mark execution cancelled: {e}");
        }
        self.audit_execution(execution, "cancelled", None).await;

        let target = match scope {
            CancelScope::Task => TaskStatus::Cancelled,
            CancelScope::ExecutionOnly => match kind {
                LaunchKind::Planning => TaskStatus::Todo,
                LaunchKind::Implementation { .. } => TaskStatus::PlanReviewing,
            },
        };
        if let LaunchKind::Implementation { worktree, .. } = kind
            && let Err(e) = self.worktrees.mark_error(worktree.id).await
        {
            tracing::warn!("failed to mark worktree errored: {e}");
        }
        if let Err(e) = self
            .status
            .transition_task(execution.task_id, target, None, Some("execution cancelled"))
            .await
        {
            tracing::warn!("failed to move task after cancellation: {e}");
        }
        self.publish_execution_id(execution.id, "execution.cancelled");
        self.metrics.incr("execution.cancelled");
    }

    /// Cancel one execution, keeping the task alive (it returns to its
    /// pre-execution status). Idempotent: cancelling a finished or already
    /// cancelled execution succeeds without side effects.
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        actor: Option<&str>,
    ) -> Result<(), DispatchError> {
        self.cancel_execution_scoped(execution_id, actor, CancelScope::ExecutionOnly)
            .await
    }

    async fn cancel_execution_scoped(
        &self,
        execution_id: Uuid,
        actor: Option<&str>,
        scope: CancelScope,
    ) -> Result<(), DispatchError> {
        let execution = Execution::find_by_id(&self.db.pool, execution_id)
            .await?
            .ok_or(DispatchError::ExecutionNotFound)?;
        if execution.status.is_terminal() {
            return Ok(());
        }

        let entry = self.running.get(&execution_id).map(|e| {
            *e.scope.lock().unwrap_or_else(|p| p.into_inner()) = scope;
            e.finished.clone()
        });

        let _ = AuditLog::append(
            &self.db.pool,
            AuditEntry {
                entity_type: "execution",
                entity_id: execution_id,
                actor,
                operation: "cancel_requested",
                from_state: Some(execution.status.to_string()),
                to_state: Some(ExecutionStatus::Cancelled.to_string()),
                reason: None,
            },
        )
        .await;

        match entry {
            Some(mut finished) => {
                self.supervisor.cancel(execution_id);
                // bounded wait for the driver's aftermath so callers see
                // settled state
                let deadline = self.config.grace_period + Duration::from_secs(10);
                let _ = tokio::time::timeout(deadline, async {
                    while !*finished.borrow() {
                        if finished.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            }
            None => {
                // no live process (orphaned row): finalize in place
                Execution::update_status(&self.db.pool, execution_id, ExecutionStatus::Cancelled)
                    .await?;
                let target = match scope {
                    CancelScope::Task => TaskStatus::Cancelled,
                    CancelScope::ExecutionOnly => match execution.exec_type {
                        ExecutionType::Planning => TaskStatus::Todo,
                        ExecutionType::Implementation => TaskStatus::PlanReviewing,
                    },
                };
                if let Err(e) = self
                    .status
                    .transition_task(execution.task_id, target, actor, Some("execution cancelled"))
                    .await
                {
                    tracing::debug!("task not moved on cancel: {e}");
                }
                self.publish_execution_id(execution_id, "execution.cancelled");
            }
        }
        Ok(())
    }

    /// Cancel a task: its active execution dies gracefully and the task
    /// lands in `cancelled`. Idempotent.
    pub async fn cancel_task(
        &self,
        task_id: Uuid,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Task, DispatchError> {
        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(DispatchError::TaskNotFound)?;
        if task.status == TaskStatus::Cancelled {
            return Ok(task);
        }

        if let Some(execution) = Execution::find_active_for_task(&self.db.pool, task_id).await? {
            self.cancel_execution_scoped(execution.id, actor, CancelScope::Task)
                .await?;
        } else {
            self.status
                .transition_task(task_id, TaskStatus::Cancelled, actor, reason)
                .await?;
        }

        Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(DispatchError::TaskNotFound)
    }

    /// Manual completion: `code_reviewing -> done`, worktrees reclaimed.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        actor: Option<&str>,
    ) -> Result<Task, DispatchError> {
        let task = self
            .status
            .transition_task(task_id, TaskStatus::Done, actor, Some("completed manually"))
            .await?;
        if let Err(e) = self.worktrees.destroy_for_task(task_id).await {
            tracing::warn!("failed to destroy worktrees for completed task {task_id}: {e}");
        }
        Ok(task)
    }

    /// Manual PR creation for a task whose implementation already ran (or
    /// is being wrapped up by hand).
    pub async fn open_pull_request(
        &self,
        task_id: Uuid,
        title: Option<String>,
        body: Option<String>,
        actor: Option<&str>,
    ) -> Result<PullRequest, DispatchError> {
        let (task, project) = self.load_task_and_project(task_id).await?;

        if let Some(existing) = PullRequest::find_by_task(&self.db.pool, task_id).await?
            && existing.state == autodev_db::models::pull_request::PullRequestState::Open
        {
            return Err(DispatchError::Conflict(format!(
                "task already has open pull request #{}",
                existing.number
            )));
        }

        let worktree = Worktree::find_by_task(&self.db.pool, task_id)
            .await?
            .into_iter()
            .find(|w| {
                matches!(
                    w.status,
                    autodev_db::models::worktree::WorktreeStatus::Active
                        | autodev_db::models::worktree::WorktreeStatus::Error
                )
            })
            .ok_or_else(|| {
                DispatchError::Validation("task has no worktree to open a pull request from".into())
            })?;

        let repository = parse_repository(&project.git_repo_url)
            .map(|(owner, name)| format!("{owner}/{name}"))
            .unwrap_or_else(|_| project.git_repo_url.clone());
        let request = CreatePrRequest {
            repository: repository.clone(),
            title: title.unwrap_or_else(|| task.title.clone()),
            body: body.or_else(|| task.description.clone()),
            head_branch: worktree.branch.clone(),
            base_branch: project.default_branch.clone(),
        };
        let info = self.provider.create_pull_request(&request).await?;

        let pr = PullRequest::create(
            &self.db.pool,
            Uuid::new_v4(),
            &CreatePullRequest {
                task_id,
                number: info.number,
                repository: &repository,
                title: &request.title,
                body: request.body.as_deref(),
                head_branch: &request.head_branch,
                base_branch: &request.base_branch,
                url: &info.url,
            },
        )
        .await?;

        let _ = AuditLog::append(
            &self.db.pool,
            AuditEntry {
                entity_type: "pull_request",
                entity_id: pr.id,
                actor,
                operation: "created",
                from_state: None,
                to_state: Some("open".to_string()),
                reason: None,
            },
        )
        .await;

        if task.status == TaskStatus::Implementing {
            self.status
                .transition_task(
                    task_id,
                    TaskStatus::CodeReviewing,
                    actor,
                    Some("pull request opened"),
                )
                .await?;
        }
        self.events.publish(
            &topics::pull_request(pr.id),
            "pullrequest.opened",
            serde_json::json!({ "pull_request": pr }),
        );
        Ok(pr)
    }

    /// Boot-time reconciliation: executions left in flight by a previous
    /// engine run are failed and their tasks returned.
    pub async fn recover_orphans(&self) -> Result<usize, DispatchError> {
        let orphaned = Execution::find_running(&self.db.pool).await?;
        let count = orphaned.len();
        for execution in orphaned {
            tracing::info!("recovering orphaned execution {}", execution.id);
            Execution::fail(&self.db.pool, execution.id, "orphaned by engine restart").await?;
            self.audit_execution(&execution, "failed", Some("orphaned by engine restart"))
                .await;

            let target = match execution.exec_type {
                ExecutionType::Planning => TaskStatus::Todo,
                ExecutionType::Implementation => TaskStatus::PlanReviewing,
            };
            if let Err(e) = self
                .status
                .transition_task(execution.task_id, target, None, Some("engine restart"))
                .await
            {
                tracing::debug!("orphan task not moved: {e}");
            }
        }

        for process in ExecutionProcess::find_running(&self.db.pool).await? {
            ExecutionProcess::finish(&self.db.pool, process.id, ProcessStatus::Error, None).await?;
        }
        Ok(count)
    }

    /// Graceful shutdown: reject new work, cancel running executions and
    /// wait for their aftermath, bounded by the configured timeout.
    pub async fn shutdown_gracefully(&self) {
        self.shutdown.cancel();
        let watchers: Vec<(Uuid, watch::Receiver<bool>)> = self
            .running
            .iter()
            .map(|e| (*e.key(), e.value().finished.clone()))
            .collect();
        for (execution_id, _) in &watchers {
            self.supervisor.cancel(*execution_id);
        }

        let drain = async {
            for (execution_id, mut finished) in watchers {
                while !*finished.borrow() {
                    if finished.changed().await.is_err() {
                        break;
                    }
                }
                tracing::debug!(%execution_id, "execution drained");
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!("shutdown timeout expired; abandoning running executions");
        }
    }

    async fn audit_execution(&self, execution: &Execution, to_state: &str, reason: Option<&str>) {
        if let Err(e) = AuditLog::append(
            &self.db.pool,
            AuditEntry {
                entity_type: "execution",
                entity_id: execution.id,
                actor: None,
                operation: "status_change",
                from_state: Some(execution.status.to_string()),
                to_state: Some(to_state.to_string()),
                reason,
            },
        )
        .await
        {
            tracing::warn!("failed to append execution audit entry: {e}");
        }
    }

    fn publish_execution(&self, execution: &Execution, event_type: &str) {
        self.events.publish(
            &topics::execution(execution.id),
            event_type,
            serde_json::json!({ "execution": execution }),
        );
    }

    fn publish_execution_id(&self, execution_id: Uuid, event_type: &str) {
        self.events.publish(
            &topics::execution(execution_id),
            event_type,
            serde_json::json!({ "execution_id": execution_id }),
        );
    }
}

enum LaunchKind {
    Planning,
    Implementation {
        project: Box<Project>,
        task: Box<Task>,
        worktree: Box<Worktree>,
    },
}

fn output_to_steps(outputs: &[PlanStepOutput]) -> Vec<PlanStep> {
    let mut steps: Vec<PlanStep> = outputs
        .iter()
        .enumerate()
        .map(|(idx, step)| PlanStep {
            id: Uuid::new_v4(),
            description: step.description.clone(),
            action: step.action.clone(),
            parameters: step.parameters.clone(),
            order: step.order.unwrap_or(idx as i64 + 1),
            completed: false,
            completed_at: None,
        })
        .collect();
    steps.sort_by_key(|s| s.order);
    steps
}

fn plan_to_output(plan: &Plan) -> PlanOutput {
    PlanOutput {
        title: plan.title.clone(),
        description: plan.description.clone(),
        steps: plan
            .steps
            .0
            .iter()
            .map(|s| PlanStepOutput {
                description: s.description.clone(),
                action: s.action.clone(),
                parameters: s.parameters.clone(),
                order: Some(s.order),
            })
            .collect(),
        context: Some(plan.context.0.clone()),
    }
}
