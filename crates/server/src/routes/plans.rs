use autodev_db::models::plan::{Plan, PlanStatus, PlanVersion, UpdatePlanContent};
use autodev_utils::response::ApiResponse;
use axum::{
    Extension, Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post, put},
};
use serde::Deserialize;

use crate::{error::ApiError, middleware::load_plan_middleware, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ApprovePayload {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectPayload {
    pub actor: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackPayload {
    pub version: i64,
}

pub async fn get_plan(Extension(plan): Extension<Plan>) -> ResponseJson<ApiResponse<Plan>> {
    ResponseJson(ApiResponse::success(plan))
}

pub async fn update_plan(
    Extension(plan): Extension<Plan>,
    State(state): State<AppState>,
    Json(payload): Json<UpdatePlanContent>,
) -> Result<ResponseJson<ApiResponse<Plan>>, ApiError> {
    let plan = Plan::update_content(&state.db.pool, plan.id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(plan)))
}

/// Approve the plan. A draft passes through `reviewing` first so the
/// machine only ever takes legal edges; both hops are audited.
pub async fn approve_plan(
    Extension(plan): Extension<Plan>,
    State(state): State<AppState>,
    payload: Option<Json<ApprovePayload>>,
) -> Result<ResponseJson<ApiResponse<Plan>>, ApiError> {
    let actor = payload.and_then(|Json(p)| p.actor);
    if plan.status == PlanStatus::Draft {
        state
            .status
            .transition_plan(plan.id, PlanStatus::Reviewing, actor.as_deref(), None)
            .await?;
    }
    let plan = state
        .status
        .transition_plan(plan.id, PlanStatus::Approved, actor.as_deref(), None)
        .await?;
    Ok(ResponseJson(ApiResponse::success(plan)))
}

pub async fn reject_plan(
    Extension(plan): Extension<Plan>,
    State(state): State<AppState>,
    payload: Option<Json<RejectPayload>>,
) -> Result<ResponseJson<ApiResponse<Plan>>, ApiError> {
    let (actor, reason) = payload
        .map(|Json(p)| (p.actor, p.reason))
        .unwrap_or_default();
    if plan.status == PlanStatus::Draft {
        state
            .status
            .transition_plan(plan.id, PlanStatus::Reviewing, actor.as_deref(), None)
            .await?;
    }
    let plan = state
        .status
        .transition_plan(
            plan.id,
            PlanStatus::Rejected,
            actor.as_deref(),
            reason.as_deref(),
        )
        .await?;

    // a rejected plan sends its task back to planning for revision
    let task = autodev_db::models::task::Task::find_by_id(&state.db.pool, plan.task_id).await?;
    if let Some(task) = task
        && task.status == autodev_db::models::task::TaskStatus::PlanReviewing
    {
        state
            .status
            .transition_task(
                task.id,
                autodev_db::models::task::TaskStatus::Planning,
                actor.as_deref(),
                Some("plan rejected"),
            )
            .await?;
    }
    Ok(ResponseJson(ApiResponse::success(plan)))
}

pub async fn plan_versions(
    Extension(plan): Extension<Plan>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<PlanVersion>>>, ApiError> {
    let versions = Plan::versions(&state.db.pool, plan.id).await?;
    Ok(ResponseJson(ApiResponse::success(versions)))
}

/// Restore an older version's content as a new version.
pub async fn rollback_plan(
    Extension(plan): Extension<Plan>,
    State(state): State<AppState>,
    Json(payload): Json<RollbackPayload>,
) -> Result<ResponseJson<ApiResponse<Plan>>, ApiError> {
    let plan = Plan::rollback(&state.db.pool, plan.id, payload.version).await?;
    Ok(ResponseJson(ApiResponse::success(plan)))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let plan_id_router = Router::new()
        .route("/", get(get_plan).put(update_plan))
        .route("/approve", post(approve_plan))
        .route("/reject", post(reject_plan))
        .route("/versions", get(plan_versions))
        .route("/rollback", post(rollback_plan))
        .layer(from_fn_with_state(state.clone(), load_plan_middleware));

    Router::new().nest("/plans", Router::new().nest("/{plan_id}", plan_id_router))
}
