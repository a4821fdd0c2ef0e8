use autodev_db::models::{
    execution::Execution, plan::Plan, project::Project, task::Task, worktree::Worktree,
};
use axum::{
    extract::{Path, Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Load the path's entity once and stash it as a request extension, so
/// handlers receive the row instead of re-querying (and 404s are uniform).

/// Archived projects still load here (restore needs them); mutating model
/// operations re-check liveness themselves.
pub async fn load_project_middleware(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let project = Project::find_by_id_with_deleted(&state.db.pool, project_id)
        .await?
        .ok_or(ApiError::NotFound("project"))?;
    req.extensions_mut().insert(project);
    Ok(next.run(req).await)
}

pub async fn load_task_middleware(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let task = Task::find_by_id(&state.db.pool, task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    req.extensions_mut().insert(task);
    Ok(next.run(req).await)
}

pub async fn load_plan_middleware(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let plan = Plan::find_by_id(&state.db.pool, plan_id)
        .await?
        .ok_or(ApiError::NotFound("plan"))?;
    req.extensions_mut().insert(plan);
    Ok(next.run(req).await)
}

pub async fn load_execution_middleware(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let execution = Execution::find_by_id(&state.db.pool, execution_id)
        .await?
        .ok_or(ApiError::NotFound("execution"))?;
    req.extensions_mut().insert(execution);
    Ok(next.run(req).await)
}

pub async fn load_worktree_middleware(
    State(state): State<AppState>,
    Path(worktree_id): Path<Uuid>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let worktree = Worktree::find_by_id(&state.db.pool, worktree_id)
        .await?
        .ok_or(ApiError::NotFound("worktree"))?;
    req.extensions_mut().insert(worktree);
    Ok(next.run(req).await)
}
