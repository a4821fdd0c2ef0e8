//! Model-level integration tests against a real SQLite file per test.

use autodev_db::{
    DbService,
    models::{
        audit_log::{AuditEntry, AuditLog},
        execution::{Execution, ExecutionError, ExecutionStatus, ExecutionType},
        execution_log::{ExecutionLog, LogEntry, LogLevel, LogSource},
        plan::{CreatePlan, Plan, PlanStatus, PlanStep, UpdatePlanContent},
        project::{CreateProject, Project, ProjectError},
        pull_request::{CreatePullRequest, PullRequest, PullRequestState},
        task::{CreateTask, Task, TaskError, TaskStatus},
        task_status_history::TaskStatusHistory,
        worktree::{Worktree, WorktreeRowError, WorktreeStatus},
    },
};
use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use uuid::Uuid;

async fn setup_test_db() -> (DbService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.sqlite");
    let db = DbService::new(&db_path).await.unwrap();
    (db, temp_dir)
}

fn project_data(name: &str) -> CreateProject {
    CreateProject {
        name: name.to_string(),
        git_repo_url: "https://github.com/acme/demo.git".to_string(),
        git_repo_path: format!("/tmp/repos/{name}"),
        default_branch: None,
        auto_merge: None,
        require_approval: None,
        max_concurrent_tasks: Some(2),
        planning_timeout_mins: None,
        implementation_timeout_mins: None,
    }
}

async fn create_project(db: &DbService, name: &str) -> Project {
    Project::create(&db.pool, &project_data(name), Uuid::new_v4())
        .await
        .unwrap()
}

async fn create_task(db: &DbService, project_id: Uuid, title: &str) -> Task {
    Task::create(
        &db.pool,
        &CreateTask {
            project_id,
            title: title.to_string(),
            description: None,
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

#[tokio::test]
async fn project_name_unique_among_live_rows() {
    let (db, _tmp) = setup_test_db().await;
    create_project(&db, "Demo").await;

    let err = Project::create(&db.pool, &project_data("Demo"), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectError::DuplicateName(_)));
}

#[tokio::test]
async fn archived_project_frees_its_name_and_restore_reverses() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;

    Project::archive(&db.pool, project.id).await.unwrap();
    assert!(Project::find_by_id(&db.pool, project.id).await.unwrap().is_none());
    assert!(
        Project::find_by_id_with_deleted(&db.pool, project.id)
            .await
            .unwrap()
            .is_some()
    );
    assert!(Project::fetch_all(&db.pool).await.unwrap().is_empty());

    // name is reusable while archived
    let other = create_project(&db, "Demo").await;

    // restoring now collides with the new live project
    let err = Project::restore(&db.pool, project.id).await.unwrap_err();
    assert!(matches!(err, ProjectError::DuplicateName(_)));

    Project::archive(&db.pool, other.id).await.unwrap();
    let restored = Project::restore(&db.pool, project.id).await.unwrap();
    assert!(restored.deleted_at.is_none());
}

#[tokio::test]
async fn project_rejects_zero_concurrency() {
    let (db, _tmp) = setup_test_db().await;
    let mut data = project_data("Demo");
    data.max_concurrent_tasks = Some(0);
    let err = Project::create(&db.pool, &data, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ProjectError::Validation(_)));
}

#[tokio::test]
async fn task_title_unique_within_project() {
    let (db, _tmp) = setup_test_db().await;
    let p1 = create_project(&db, "One").await;
    let p2 = create_project(&db, "Two").await;
    create_task(&db, p1.id, "Add auth").await;

    // same title in another project is fine
    create_task(&db, p2.id, "Add auth").await;

    let err = Task::create(
        &db.pool,
        &CreateTask {
            project_id: p1.id,
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
    .unwrap_err();
    assert!(matches!(err, TaskError::DuplicateTitle(_)));
}

#[tokio::test]
async fn task_create_rejects_dangling_project() {
    let (db, _tmp) = setup_test_db().await;
    let err = Task::create(
        &db.pool,
        &CreateTask {
            project_id: Uuid::new_v4(),
            title: "Orphan".to_string(),
            description: None,
            priority: None,
            parent_task_id: None,
            tags: None,
            assignee: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TaskError::ProjectNotFound));
}

#[tokio::test]
async fn count_active_tracks_slot_occupying_statuses() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let t1 = create_task(&db, project.id, "T1").await;
    let t2 = create_task(&db, project.id, "T2").await;
    let t3 = create_task(&db, project.id, "T3").await;

    Task::update_status(&db.pool, t1.id, TaskStatus::Implementing).await.unwrap();
    Task::update_status(&db.pool, t2.id, TaskStatus::CodeReviewing).await.unwrap();
    Task::update_status(&db.pool, t3.id, TaskStatus::Planning).await.unwrap();

    let active = Task::count_active_for_project(&db.pool, project.id).await.unwrap();
    assert_eq!(active, 2);
}

#[tokio::test]
async fn task_listing_carries_execution_flags() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;

    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();

    let listed = Task::fetch_all_with_status(&db.pool, project.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].has_in_progress_execution);
    assert!(!listed[0].last_execution_failed);
    assert_eq!(listed[0].execution_count, 1);

    Execution::fail(&db.pool, exec.id, "agent exploded").await.unwrap();
    let listed = Task::fetch_all_with_status(&db.pool, project.id).await.unwrap();
    assert!(!listed[0].has_in_progress_execution);
    assert!(listed[0].last_execution_failed);
}

#[tokio::test]
async fn at_most_one_execution_in_flight_per_task() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;

    let first = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Running);

    let err = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::AlreadyActive));

    // finishing the first frees the slot
    Execution::complete(&db.pool, first.id, None).await.unwrap();
    Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Implementation)
        .await
        .unwrap();
}

#[tokio::test]
async fn execution_complete_sets_result_and_progress() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;
    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();

    Execution::update_progress(&db.pool, exec.id, 0.5).await.unwrap();
    Execution::complete(&db.pool, exec.id, Some(serde_json::json!({"plan": {"title": "x"}})))
        .await
        .unwrap();

    let done = Execution::find_by_id(&db.pool, exec.id).await.unwrap().unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.progress, 1.0);
    assert!(done.completed_at.is_some());
    assert_eq!(done.result.unwrap().0["plan"]["title"], "x");
}

fn log_entry(execution_id: Uuid, line: i64, message: &str) -> LogEntry {
    LogEntry {
        execution_id,
        line,
        level: LogLevel::Info,
        source: LogSource::Stdout,
        message: message.to_string(),
        metadata: None,
        logged_at: Utc::now(),
    }
}

#[tokio::test]
async fn log_redelivery_updates_in_place() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;
    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();

    ExecutionLog::batch_upsert(&db.pool, &[log_entry(exec.id, 42, "A")]).await.unwrap();
    let before = ExecutionLog::count_for_execution(&db.pool, exec.id).await.unwrap();

    ExecutionLog::batch_upsert(&db.pool, &[log_entry(exec.id, 42, "B")]).await.unwrap();
    let after = ExecutionLog::count_for_execution(&db.pool, exec.id).await.unwrap();

    assert_eq!(before, 1);
    assert_eq!(after, 1);
    let rows = ExecutionLog::fetch_for_execution(&db.pool, exec.id, None, None).await.unwrap();
    assert_eq!(rows[0].message, "B");
}

#[tokio::test]
async fn log_batches_cross_chunk_boundaries() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;
    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();

    let entries: Vec<LogEntry> = (1..=250)
        .map(|i| log_entry(exec.id, i, &format!("line {i}")))
        .collect();
    ExecutionLog::batch_upsert(&db.pool, &entries).await.unwrap();

    let count = ExecutionLog::count_for_execution(&db.pool, exec.id).await.unwrap();
    assert_eq!(count, 250);

    // line numbers are strictly increasing with no duplicates
    let rows = ExecutionLog::fetch_for_execution(&db.pool, exec.id, None, None).await.unwrap();
    let lines: Vec<i64> = rows.iter().map(|r| r.line).collect();
    let mut sorted = lines.clone();
    sorted.dedup();
    assert_eq!(lines, sorted);
    assert_eq!(lines.first(), Some(&1));
    assert_eq!(lines.last(), Some(&250));
}

#[tokio::test]
async fn log_rotation_keeps_newest() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;
    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();

    let entries: Vec<LogEntry> = (1..=50).map(|i| log_entry(exec.id, i, "x")).collect();
    ExecutionLog::batch_upsert(&db.pool, &entries).await.unwrap();

    let removed = ExecutionLog::rotate(&db.pool, exec.id, 10).await.unwrap();
    assert_eq!(removed, 40);

    let rows = ExecutionLog::fetch_for_execution(&db.pool, exec.id, None, None).await.unwrap();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0].line, 41);
}

#[tokio::test]
async fn cleanup_drops_old_finished_executions_and_children() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;
    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();
    ExecutionLog::batch_upsert(&db.pool, &[log_entry(exec.id, 1, "old")]).await.unwrap();
    Execution::complete(&db.pool, exec.id, None).await.unwrap();

    // nothing is old enough yet
    let removed = Execution::cleanup_older_than(&db.pool, Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let removed = Execution::cleanup_older_than(&db.pool, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let logs = ExecutionLog::count_for_execution(&db.pool, exec.id).await.unwrap();
    assert_eq!(logs, 0);
}

#[tokio::test]
async fn plan_versions_increase_and_rollback_never_reuses() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;

    let plan = Plan::create(
        &db.pool,
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
    assert_eq!(plan.version, 1);
    assert_eq!(plan.status, PlanStatus::Draft);

    let plan = Plan::update_content(
        &db.pool,
        plan.id,
        &UpdatePlanContent {
            title: Some("Auth plan v2".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(plan.version, 2);

    let mut tx = db.pool.begin().await.unwrap();
    let plan = Plan::set_status(&mut tx, plan.id, PlanStatus::Approved)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(plan.version, 3);
    assert!(plan.approved_at.is_some());

    let plan = Plan::rollback(&db.pool, plan.id, 1).await.unwrap();
    assert_eq!(plan.version, 4);
    assert_eq!(plan.title, "Auth plan");

    let versions = Plan::versions(&db.pool, plan.id).await.unwrap();
    let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn worktree_branch_and_path_uniqueness() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let t1 = create_task(&db, project.id, "T1").await;
    let t2 = create_task(&db, project.id, "T2").await;

    let wt = Worktree::create(&db.pool, Uuid::new_v4(), t1.id, project.id, "task/abc", "/wt/abc")
        .await
        .unwrap();
    assert_eq!(wt.status, WorktreeStatus::Creating);

    let err = Worktree::create(&db.pool, Uuid::new_v4(), t2.id, project.id, "task/abc", "/wt/xyz")
        .await
        .unwrap_err();
    assert!(matches!(err, WorktreeRowError::DuplicateBranch(_)));

    let err = Worktree::create(&db.pool, Uuid::new_v4(), t2.id, project.id, "task/xyz", "/wt/abc")
        .await
        .unwrap_err();
    assert!(matches!(err, WorktreeRowError::DuplicatePath(_)));

    // completed worktrees release both names
    Worktree::update_status(&db.pool, wt.id, WorktreeStatus::Completed).await.unwrap();
    Worktree::create(&db.pool, Uuid::new_v4(), t2.id, project.id, "task/abc", "/wt/abc")
        .await
        .unwrap();
}

#[tokio::test]
async fn open_pull_requests_form_the_monitor_working_set() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;

    let pr = PullRequest::create(
        &db.pool,
        Uuid::new_v4(),
        &CreatePullRequest {
            task_id: task.id,
            number: 7,
            repository: "acme/demo",
            title: "Add auth",
            body: None,
            head_branch: "task/abc",
            base_branch: "main",
            url: "https://github.com/acme/demo/pull/7",
        },
    )
    .await
    .unwrap();
    assert_eq!(pr.state, PullRequestState::Open);
    assert_eq!(PullRequest::find_open(&db.pool).await.unwrap().len(), 1);

    PullRequest::update_state(&db.pool, pr.id, PullRequestState::Merged, Some(Utc::now()))
        .await
        .unwrap();
    assert!(PullRequest::find_open(&db.pool).await.unwrap().is_empty());

    let merged = PullRequest::find_by_id(&db.pool, pr.id).await.unwrap().unwrap();
    assert_eq!(merged.state, PullRequestState::Merged);
    assert!(merged.merged_at.is_some());
}

#[tokio::test]
async fn history_and_audit_replay_in_order() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;

    TaskStatusHistory::append(
        &db.pool,
        task.id,
        TaskStatus::Todo,
        TaskStatus::Planning,
        Some("alice"),
        None,
    )
    .await
    .unwrap();
    TaskStatusHistory::append(
        &db.pool,
        task.id,
        TaskStatus::Planning,
        TaskStatus::PlanReviewing,
        None,
        Some("planner finished"),
    )
    .await
    .unwrap();

    let history = TaskStatusHistory::fetch_for_task(&db.pool, task.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].to_status, TaskStatus::Planning);
    assert_eq!(history[1].to_status, TaskStatus::PlanReviewing);
    assert_eq!(history[1].actor, None);

    AuditLog::append(
        &db.pool,
        AuditEntry {
            entity_type: "task",
            entity_id: task.id,
            actor: Some("alice"),
            operation: "status_transition",
            from_state: Some("todo".to_string()),
            to_state: Some("planning".to_string()),
            reason: None,
        },
    )
    .await
    .unwrap();
    let audit = AuditLog::fetch_for_entity(&db.pool, "task", task.id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operation, "status_transition");
}

#[tokio::test]
async fn with_transaction_commits_on_ok_and_rolls_back_on_err() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;

    // committed path
    let committed: Result<(), sqlx::Error> = db
        .with_transaction(|conn| {
            let task_id = task.id;
            Box::pin(async move {
                Task::update_status(&mut *conn, task_id, TaskStatus::Planning).await?;
                TaskStatusHistory::append(
                    &mut *conn,
                    task_id,
                    TaskStatus::Todo,
                    TaskStatus::Planning,
                    None,
                    None,
                )
                .await
            })
        })
        .await;
    committed.unwrap();
    let reread = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reread.status, TaskStatus::Planning);

    // rolled-back path: the status write inside must not survive the error
    let result: Result<(), sqlx::Error> = db
        .with_transaction(|conn| {
            let task_id = task.id;
            Box::pin(async move {
                Task::update_status(&mut *conn, task_id, TaskStatus::PlanReviewing).await?;
                Err(sqlx::Error::RowNotFound)
            })
        })
        .await;
    assert!(result.is_err());
    let reread = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(reread.status, TaskStatus::Planning);
}

#[tokio::test]
async fn dangling_references_are_rejected_before_insert() {
    let (db, _tmp) = setup_test_db().await;

    let err = Execution::create(&db.pool, Uuid::new_v4(), Uuid::new_v4(), ExecutionType::Planning)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::TaskNotFound));

    let err = Plan::create(
        &db.pool,
        &CreatePlan {
            task_id: Uuid::new_v4(),
            title: "orphan plan".to_string(),
            description: None,
            steps: vec![],
            context: None,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, autodev_db::models::plan::PlanError::TaskNotFound));
}

#[tokio::test]
async fn project_cascade_removes_the_whole_tree() {
    let (db, _tmp) = setup_test_db().await;
    let project = create_project(&db, "Demo").await;
    let task = create_task(&db, project.id, "T1").await;
    let exec = Execution::create(&db.pool, Uuid::new_v4(), task.id, ExecutionType::Planning)
        .await
        .unwrap();
    ExecutionLog::batch_upsert(&db.pool, &[log_entry(exec.id, 1, "x")]).await.unwrap();

    sqlx::query("DELETE FROM projects WHERE id = $1")
        .bind(project.id)
        .execute(&db.pool)
        .await
        .unwrap();

    assert!(Task::find_by_id(&db.pool, task.id).await.unwrap().is_none());
    assert!(Execution::find_by_id(&db.pool, exec.id).await.unwrap().is_none());
    assert_eq!(ExecutionLog::count_for_execution(&db.pool, exec.id).await.unwrap(), 0);
}
