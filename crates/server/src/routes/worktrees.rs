use autodev_db::models::{
    task::Task,
    worktree::{Worktree, WorktreeStatus},
};
use autodev_utils::response::ApiResponse;
use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::get,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, middleware::load_worktree_middleware, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WorktreeQuery {
    pub project_id: Option<Uuid>,
    pub status: Option<WorktreeStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorktreePayload {
    pub task_id: Uuid,
}

pub async fn list_worktrees(
    State(state): State<AppState>,
    Query(query): Query<WorktreeQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Worktree>>>, ApiError> {
    let worktrees = Worktree::fetch_all(&state.db.pool, query.project_id, query.status).await?;
    Ok(ResponseJson(ApiResponse::success(worktrees)))
}

/// Manual worktree creation for a task (normally the dispatcher does this).
pub async fn create_worktree(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorktreePayload>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<Worktree>>), ApiError> {
    let task = Task::find_by_id(&state.db.pool, payload.task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    let project = task
        .parent_project(&state.db.pool)
        .await?
        .ok_or(ApiError::NotFound("project"))?;

    let worktree = state.worktrees.create(&project, &task).await?;
    Ok((
        StatusCode::CREATED,
        ResponseJson(ApiResponse::success(worktree)),
    ))
}

pub async fn get_worktree(
    Extension(worktree): Extension<Worktree>,
) -> ResponseJson<ApiResponse<Worktree>> {
    ResponseJson(ApiResponse::success(worktree))
}

pub async fn destroy_worktree(
    Extension(worktree): Extension<Worktree>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state.worktrees.destroy(worktree.id).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let worktree_id_router = Router::new()
        .route("/", get(get_worktree).delete(destroy_worktree))
        .layer(from_fn_with_state(state.clone(), load_worktree_middleware));

    let inner = Router::new()
        .route("/", get(list_worktrees).post(create_worktree))
        .nest("/{worktree_id}", worktree_id_router);

    Router::new().nest("/worktrees", inner)
}
