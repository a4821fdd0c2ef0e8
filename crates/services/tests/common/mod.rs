//! Shared harness for service integration tests: temp SQLite database,
//! scripted repo provider, real child processes and (where needed) real
//! git repositories under a tempdir.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use autodev_db::{
    DbService,
    models::{
        plan::{CreatePlan, Plan, PlanStatus, PlanStep},
        project::{CreateProject, Project},
        task::{CreateTask, Task},
    },
};
use autodev_services::services::{
    config::Config,
    dispatcher::Dispatcher,
    events::EventBus,
    github::{CreatePrRequest, PrInfo, ProviderError, RepoProvider},
    log_pipeline::{LogPipeline, LogPipelineConfig},
    metrics::MetricsService,
    status::StatusService,
    supervisor::ProcessSupervisor,
    worktree_manager::WorktreeManager,
};
use autodev_db::models::pull_request::PullRequestState;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scripted stand-in for the hosted-repository provider.
#[derive(Default)]
pub struct FakeProvider {
    pub created: std::sync::Mutex<Vec<CreatePrRequest>>,
    pub states: std::sync::Mutex<std::collections::HashMap<i64, PrInfo>>,
    pub fail_creates: std::sync::atomic::AtomicBool,
}

impl FakeProvider {
    pub fn set_state(&self, number: i64, state: PullRequestState) {
        let mut states = self.states.lock().unwrap();
        let merged_at =
            (state == PullRequestState::Merged).then(chrono::Utc::now);
        states.insert(
            number,
            PrInfo {
                number,
                url: format!("https://example.test/pr/{number}"),
                state,
                merged_at,
            },
        );
    }
}

#[async_trait]
impl RepoProvider for FakeProvider {
    async fn create_pull_request(&self, req: &CreatePrRequest) -> Result<PrInfo, ProviderError> {
        if self.fail_creates.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ProviderError::Api("provider unavailable".to_string()));
        }
        let mut created = self.created.lock().unwrap();
        let number = created.len() as i64 + 1;
        created.push(req.clone());
        let info = PrInfo {
            number,
            url: format!("https://example.test/pr/{number}"),
            state: PullRequestState::Open,
            merged_at: None,
        };
        self.states.lock().unwrap().insert(number, info.clone());
        Ok(info)
    }

    async fn get_pull_request(
        &self,
        _repository: &str,
        number: i64,
    ) -> Result<PrInfo, ProviderError> {
        self.states
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| ProviderError::Api(format!("unknown pr {number}")))
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub db: DbService,
    pub config: Arc<Config>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<MetricsService>,
    pub status: Arc<StatusService>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub worktrees: Arc<WorktreeManager>,
    pub provider: Arc<FakeProvider>,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: CancellationToken,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let db = DbService::new(&tmp.path().join("test.sqlite")).await.unwrap();

    let mut config = Config {
        data_dir: tmp.path().to_path_buf(),
        worktree_base_dir: tmp.path().join("worktrees"),
        grace_period: Duration::from_secs(2),
        process_sample_interval: Duration::from_millis(500),
        log_batch_interval: Duration::from_millis(50),
        ai_planner_command: format!("sh {}", tmp.path().join("planner.sh").display()),
        ai_implementer_command: format!("sh {}", tmp.path().join("implementer.sh").display()),
        ..Config::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    let events = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsService::new());
    let status = Arc::new(StatusService::new(
        db.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new(
        db.clone(),
        config.grace_period,
        config.process_sample_interval,
    ));
    let worktrees = Arc::new(WorktreeManager::new(
        db.clone(),
        config.worktree_base_dir.clone(),
    ));
    let pipeline = Arc::new(LogPipeline::new(
        db.clone(),
        events.clone(),
        LogPipelineConfig {
            batch_size: config.log_batch_size,
            batch_interval: config.log_batch_interval,
            ..LogPipelineConfig::default()
        },
    ));
    let provider = Arc::new(FakeProvider::default());
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        db.clone(),
        config.clone(),
        events.clone(),
        status.clone(),
        supervisor.clone(),
        worktrees.clone(),
        provider.clone(),
        pipeline,
        metrics.clone(),
        shutdown.clone(),
    );

    Harness {
        tmp,
        db,
        config,
        events,
        metrics,
        status,
        supervisor,
        worktrees,
        provider,
        dispatcher,
        shutdown,
    }
}

impl Harness {
    /// Project backed by a real git repository with one commit on `main`.
    pub async fn project_with_repo(&self, name: &str) -> Project {
        let repo_path = self.tmp.path().join(format!("repo-{name}"));
        init_git_repo(&repo_path).await;
        self.project_at(name, &repo_path).await
    }

    /// Project whose repo path is a plain directory (enough for planning).
    pub async fn project_plain(&self, name: &str) -> Project {
        let repo_path = self.tmp.path().join(format!("dir-{name}"));
        tokio::fs::create_dir_all(&repo_path).await.unwrap();
        self.project_at(name, &repo_path).await
    }

    async fn project_at(&self, name: &str, repo_path: &Path) -> Project {
        Project::create(
            &self.db.pool,
            &CreateProject {
                name: name.to_string(),
                git_repo_url: "https://github.com/acme/demo.git".to_string(),
                git_repo_path: repo_path.display().to_string(),
                default_branch: Some("main".to_string()),
                auto_merge: None,
                require_approval: None,
                max_concurrent_tasks: Some(2),
                planning_timeout_mins: None,
                implementation_timeout_mins: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap()
    }

    pub async fn task(&self, project: &Project, title: &str) -> Task {
        Task::create(
            &self.db.pool,
            &CreateTask {
                project_id: project.id,
                title: title.to_string(),
                description: Some("integration test task".to_string()),
                priority: None,
                parent_task_id: None,
                tags: None,
                assignee: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap()
    }

    /// Draft plan pushed through reviewing to approved.
    pub async fn approved_plan(&self, task: &Task) -> Plan {
        let plan = Plan::create(
            &self.db.pool,
            &CreatePlan {
                task_id: task.id,
                title: format!("Plan for {}", task.title),
                description: None,
                steps: vec![PlanStep {
                    id: Uuid::new_v4(),
                    description: "do the thing".to_string(),
                    action: None,
                    parameters: None,
                    order: 1,
                    completed: false,
                    completed_at: None,
                }],
                context: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        self.status
            .transition_plan(plan.id, PlanStatus::Reviewing, Some("tester"), None)
            .await
            .unwrap();
        self.status
            .transition_plan(plan.id, PlanStatus::Approved, Some("tester"), None)
            .await
            .unwrap()
    }

    /// Write a shell script and return a command line that runs it.
    pub fn script(&self, name: &str, body: &str) -> String {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        format!("sh {}", path.display())
    }

    /// Body of the planner agent the dispatcher will spawn.
    pub fn write_planner(&self, body: &str) {
        self.script("planner.sh", body);
    }

    /// Body of the implementer agent the dispatcher will spawn.
    pub fn write_implementer(&self, body: &str) {
        self.script("implementer.sh", body);
    }
}

pub async fn init_git_repo(path: &PathBuf) {
    tokio::fs::create_dir_all(path).await.unwrap();
    git(path, &["init", "-b", "main"]).await;
    tokio::fs::write(path.join("README.md"), "# demo\n").await.unwrap();
    git(path, &["add", "."]).await;
    git(
        path,
        &[
            "-c",
            "user.name=tester",
            "-c",
            "user.email=tester@example.test",
            "-c",
            "commit.gpgsign=false",
            "commit",
            "-m",
            "init",
        ],
    )
    .await;
}

async fn git(path: &Path, args: &[&str]) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Poll until `predicate` returns true or the timeout expires.
pub async fn wait_until<F>(timeout: Duration, mut predicate: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
