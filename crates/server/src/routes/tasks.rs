use autodev_db::models::{
    execution::Execution,
    task::{CreateTask, Task, TaskStatus, UpdateTask},
    task_status_history::TaskStatusHistory,
};
use autodev_utils::response::ApiResponse;
use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, middleware::load_task_middleware, state::AppState};

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub project_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ActorPayload {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelPayload {
    pub actor: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub actor: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks = Task::fetch_all(&state.db.pool, query.project_id, query.status).await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<CreateTask>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<Task>>), ApiError> {
    tracing::debug!(
        "creating task '{}' in project {}",
        payload.title,
        payload.project_id
    );
    let task = Task::create(&state.db.pool, &payload, Uuid::new_v4()).await?;
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(task))))
}

pub async fn get_task(Extension(task): Extension<Task>) -> ResponseJson<ApiResponse<Task>> {
    ResponseJson(ApiResponse::success(task))
}

pub async fn update_task(
    Extension(existing): Extension<Task>,
    State(state): State<AppState>,
    Json(payload): Json<UpdateTask>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    // field-level merge: omitted fields keep their value, empty description
    // clears it
    let title = payload.title.unwrap_or(existing.title);
    let description = match payload.description {
        Some(s) if s.trim().is_empty() => None,
        Some(s) => Some(s),
        None => existing.description,
    };
    let priority = payload.priority.unwrap_or(existing.priority);
    let tags = payload.tags.unwrap_or(existing.tags.0);
    let assignee = payload.assignee.or(existing.assignee);

    let task = Task::update(
        &state.db.pool,
        existing.id,
        title,
        description,
        priority,
        tags,
        assignee,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn delete_task(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    if Execution::find_active_for_task(&state.db.pool, task.id)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict(
            "task has an execution in flight; cancel it first".to_string(),
        ));
    }

    // worktrees go before the row so nothing leaks on disk
    if let Err(e) = state.worktrees.destroy_for_task(task.id).await {
        tracing::warn!("failed to destroy worktrees for task {}: {e}", task.id);
    }
    Task::soft_delete(&state.db.pool, task.id).await?;
    tracing::info!("deleted task {}", task.id);
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn start_planning(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
    payload: Option<Json<ActorPayload>>,
) -> Result<ResponseJson<ApiResponse<Execution>>, ApiError> {
    let actor = payload.and_then(|Json(p)| p.actor);
    let execution = state.dispatcher.start_planning(task.id, actor).await?;
    Ok(ResponseJson(ApiResponse::success(execution)))
}

pub async fn start_implementation(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
    payload: Option<Json<ActorPayload>>,
) -> Result<ResponseJson<ApiResponse<Execution>>, ApiError> {
    let actor = payload.and_then(|Json(p)| p.actor);
    let execution = state.dispatcher.start_implementation(task.id, actor).await?;
    Ok(ResponseJson(ApiResponse::success(execution)))
}

pub async fn complete_task(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
    payload: Option<Json<ActorPayload>>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let actor = payload.and_then(|Json(p)| p.actor);
    let task = state
        .dispatcher
        .complete_task(task.id, actor.as_deref())
        .await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn cancel_task(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
    payload: Option<Json<CancelPayload>>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let (actor, reason) = payload
        .map(|Json(p)| (p.actor, p.reason))
        .unwrap_or_default();
    let task = state
        .dispatcher
        .cancel_task(task.id, actor.as_deref(), reason.as_deref())
        .await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn create_pull_request(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
    payload: Option<Json<PullRequestPayload>>,
) -> Result<
    (
        StatusCode,
        ResponseJson<ApiResponse<autodev_db::models::pull_request::PullRequest>>,
    ),
    ApiError,
> {
    let (title, body, actor) = payload
        .map(|Json(p)| (p.title, p.body, p.actor))
        .unwrap_or_default();
    let pr = state
        .dispatcher
        .open_pull_request(task.id, title, body, actor.as_deref())
        .await?;
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(pr))))
}

pub async fn task_history(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<TaskStatusHistory>>>, ApiError> {
    let history = TaskStatusHistory::fetch_for_task(&state.db.pool, task.id).await?;
    Ok(ResponseJson(ApiResponse::success(history)))
}

pub async fn task_plans(
    Extension(task): Extension<Task>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<autodev_db::models::plan::Plan>>>, ApiError> {
    let plans = autodev_db::models::plan::Plan::fetch_for_task(&state.db.pool, task.id).await?;
    Ok(ResponseJson(ApiResponse::success(plans)))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let task_id_router = Router::new()
        .route("/", get(get_task).put(update_task).delete(delete_task))
        .route("/plan", post(start_planning))
        .route("/implement", post(start_implementation))
        .route("/complete", post(complete_task))
        .route("/cancel", post(cancel_task))
        .route("/pull-request", post(create_pull_request))
        .route("/history", get(task_history))
        .route("/plans", get(task_plans))
        .layer(from_fn_with_state(state.clone(), load_task_middleware));

    let inner = Router::new()
        .route("/", get(list_tasks).post(create_task))
        .nest("/{task_id}", task_id_router);

    Router::new().nest("/tasks", inner)
}
