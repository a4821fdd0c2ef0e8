//! Router-level tests driving the HTTP surface with tower's oneshot.

use std::{sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::{
        plan::{CreatePlan, Plan, PlanStatus, PlanStep},
        project::Project,
        task::{Task, TaskStatus},
    },
};
use autodev_server::{routes, state::AppState};
use autodev_services::services::{
    config::Config,
    dispatcher::Dispatcher,
    events::EventBus,
    github::{DisabledProvider, RepoProvider},
    log_pipeline::{LogPipeline, LogPipelineConfig},
    metrics::MetricsService,
    pr_monitor::PrMonitorService,
    status::StatusService,
    supervisor::ProcessSupervisor,
    worktree_manager::WorktreeManager,
};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use uuid::Uuid;

struct TestApp {
    tmp: TempDir,
    app: Router,
    db: DbService,
}

async fn test_app() -> TestApp {
    let tmp = TempDir::new().unwrap();
    let db = DbService::new(&tmp.path().join("test.sqlite")).await.unwrap();
    let config = Arc::new(Config {
        data_dir: tmp.path().to_path_buf(),
        worktree_base_dir: tmp.path().join("worktrees"),
        grace_period: Duration::from_secs(2),
        webhook_secret: Some("shhh".to_string()),
        ..Config::default()
    });

    let events = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsService::new());
    let status = Arc::new(StatusService::new(db.clone(), events.clone(), metrics.clone()));
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
        LogPipelineConfig::default(),
    ));
    let provider: Arc<dyn RepoProvider> = Arc::new(DisabledProvider);
    let dispatcher = Dispatcher::new(
        db.clone(),
        config.clone(),
        events.clone(),
        status.clone(),
        supervisor,
        worktrees.clone(),
        provider.clone(),
        pipeline,
        metrics.clone(),
        CancellationToken::new(),
    );
    let pr_monitor = Arc::new(PrMonitorService::new(
        db.clone(),
        provider,
        status.clone(),
        worktrees.clone(),
        events.clone(),
        metrics.clone(),
        config.pr_poll_interval,
    ));

    let state = AppState {
        db: db.clone(),
        config,
        events,
        metrics,
        status,
        dispatcher,
        worktrees,
        pr_monitor,
    };

    TestApp {
        app: routes::router(state),
        tmp,
        db,
    }
}

impl TestApp {
    async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Project backed by a real (empty-commit) git repository.
    async fn seeded_project(&self) -> Project {
        let repo = self.tmp.path().join(format!("repo-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&repo).unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec![
                "-c",
                "user.name=t",
                "-c",
                "user.email=t@t.test",
                "-c",
                "commit.gpgsign=false",
                "commit",
                "--allow-empty",
                "-m",
                "init",
            ],
        ] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .unwrap();
            assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        }

        let (status, body) = self
            .request(
                "POST",
                "/api/v1/projects",
                Some(json!({
                    "name": format!("proj-{}", Uuid::new_v4()),
                    "git_repo_url": "https://github.com/acme/demo.git",
                    "git_repo_path": repo.display().to_string(),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        serde_json::from_value(body["data"].clone()).unwrap()
    }
}

#[tokio::test]
async fn health_check_is_ok() {
    let t = test_app().await;
    let (status, body) = t.request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], "OK");
}

#[tokio::test]
async fn project_crud_and_archive_lifecycle() {
    let t = test_app().await;
    let project = t.seeded_project().await;

    let (status, body) = t.request("GET", "/api/v1/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // non-repo path is rejected up front
    let (status, _) = t
        .request(
            "POST",
            "/api/v1/projects",
            Some(json!({
                "name": "bad",
                "git_repo_url": "https://github.com/acme/bad.git",
                "git_repo_path": "/definitely/not/a/repo",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let uri = format!("/api/v1/projects/{}", project.id);
    let (status, body) = t
        .request("PUT", &uri, Some(json!({"max_concurrent_tasks": 5})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["max_concurrent_tasks"], 5);

    // archive hides it from the list; restore brings it back
    let (status, _) = t.request("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = t.request("GET", "/api/v1/projects", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    let (status, _) = t.request("POST", &format!("{uri}/restore"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = t.request("GET", "/api/v1/projects", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn task_crud_conflicts_and_cancellation() {
    let t = test_app().await;
    let project = t.seeded_project().await;

    let (status, body) = t
        .request(
            "POST",
            "/api/v1/tasks",
            Some(json!({"project_id": project.id, "title": "Add auth", "priority": "high"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let task: Task = serde_json::from_value(body["data"].clone()).unwrap();

    // duplicate title in the same project is a conflict
    let (status, _) = t
        .request(
            "POST",
            "/api/v1/tasks",
            Some(json!({"project_id": project.id, "title": "Add auth"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // unknown task is a 404
    let (status, _) = t
        .request("GET", &format!("/api/v1/tasks/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // cancel is legal from todo and idempotent
    let cancel_uri = format!("/api/v1/tasks/{}/cancel", task.id);
    let (status, body) = t.request("POST", &cancel_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");
    let (status, _) = t.request("POST", &cancel_uri, None).await;
    assert_eq!(status, StatusCode::OK);

    // a cancelled task refuses planning: invalid transition maps to 409
    let (status, _) = t
        .request("POST", &format!("/api/v1/tasks/{}/plan", task.id), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn plan_approval_drives_task_back_and_forth() {
    let t = test_app().await;
    let project = t.seeded_project().await;

    let task = Task::create(
        &t.db.pool,
        &autodev_db::models::task::CreateTask {
            project_id: project.id,
            title: "Add auth".to_string(),
            description: None,
            priority: None,
            parent_task_id: None,
            tags: None,
            assignee: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();
    // park the task where a fresh plan would put it
    Task::update_status(&t.db.pool, task.id, TaskStatus::PlanReviewing).await.unwrap();

    let plan = Plan::create(
        &t.db.pool,
        &CreatePlan {
            task_id: task.id,
            title: "Auth plan".to_string(),
            description: None,
            steps: vec![PlanStep {
                id: Uuid::new_v4(),
                description: "add handler".to_string(),
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

    // reject sends the plan back to draft-able state and the task to planning
    let (status, body) = t
        .request(
            "POST",
            &format!("/api/v1/plans/{}/reject", plan.id),
            Some(json!({"actor": "alice", "reason": "too vague"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "rejected");
    let reread = Task::find_by_id(&t.db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reread.status, TaskStatus::Planning);

    // revise: rejected -> draft, then approve (draft -> reviewing -> approved)
    let plan = Plan::find_by_id(&t.db.pool, plan.id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Rejected);
    let (status, _) = t
        .request(
            "PUT",
            &format!("/api/v1/plans/{}", plan.id),
            Some(json!({"title": "Auth plan v2"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // move it back to draft through the machine before approval
    let (status, _) = t
        .request(
            "POST",
            &format!("/api/v1/plans/{}/approve", plan.id),
            Some(json!({"actor": "alice"})),
        )
        .await;
    // rejected plans cannot be approved directly
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn plan_versions_and_rollback_endpoints() {
    let t = test_app().await;
    let project = t.seeded_project().await;
    let task = Task::create(
        &t.db.pool,
        &autodev_db::models::task::CreateTask {
            project_id: project.id,
            title: "Add auth".to_string(),
            description: None,
            priority: None,
            parent_task_id: None,
            tags: None,
            assignee: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();
    let plan = Plan::create(
        &t.db.pool,
        &CreatePlan {
            task_id: task.id,
            title: "v1 title".to_string(),
            description: None,
            steps: vec![],
            context: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();

    let (status, _) = t
        .request(
            "PUT",
            &format!("/api/v1/plans/{}", plan.id),
            Some(json!({"title": "v2 title"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = t
        .request(
            "POST",
            &format!("/api/v1/plans/{}/rollback", plan.id),
            Some(json!({"version": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["title"], "v1 title");
    assert_eq!(body["data"]["version"], 3);

    let (status, body) = t
        .request("GET", &format!("/api/v1/plans/{}/versions", plan.id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    // rolling back to a version that never existed is a 404
    let (status, _) = t
        .request(
            "POST",
            &format!("/api/v1/plans/{}/rollback", plan.id),
            Some(json!({"version": 99})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_requires_a_valid_signature() {
    let t = test_app().await;
    let body = json!({"repository": "acme/demo", "number": 7});

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/pullrequest")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // correctly signed payload for an unknown PR is accepted (data=false)
    use hmac::{Hmac, Mac};
    let payload = body.to_string();
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"shhh").unwrap();
    mac.update(payload.as_bytes());
    let sig: String = mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect();

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/pullrequest")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", format!("sha256={sig}"))
        .body(Body::from(payload))
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn executions_listing_and_missing_ids() {
    let t = test_app().await;
    let (status, body) = t.request("GET", "/api/v1/executions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    let (status, _) = t
        .request("GET", &format!("/api/v1/executions/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
