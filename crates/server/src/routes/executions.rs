use autodev_db::models::{
    execution::{Execution, ExecutionStatus},
    execution_log::ExecutionLog,
    execution_process::ExecutionProcess,
};
use autodev_utils::response::ApiResponse;
use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiError, middleware::load_execution_middleware, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ExecutionQuery {
    pub task_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub after_line: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelPayload {
    pub actor: Option<String>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Execution>>>, ApiError> {
    let executions = Execution::fetch_all(&state.db.pool, query.task_id, query.status).await?;
    Ok(ResponseJson(ApiResponse::success(executions)))
}

pub async fn get_execution(
    Extension(execution): Extension<Execution>,
) -> ResponseJson<ApiResponse<Execution>> {
    ResponseJson(ApiResponse::success(execution))
}

pub async fn cancel_execution(
    Extension(execution): Extension<Execution>,
    State(state): State<AppState>,
    payload: Option<Json<CancelPayload>>,
) -> Result<ResponseJson<ApiResponse<Execution>>, ApiError> {
    let actor = payload.and_then(|Json(p)| p.actor);
    state
        .dispatcher
        .cancel_execution(execution.id, actor.as_deref())
        .await?;
    let execution = Execution::find_by_id(&state.db.pool, execution.id)
        .await?
        .ok_or(ApiError::NotFound("execution"))?;
    Ok(ResponseJson(ApiResponse::success(execution)))
}

/// Paged log read; `after_line` makes it a resync cursor for WS clients.
pub async fn execution_logs(
    Extension(execution): Extension<Execution>,
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ExecutionLog>>>, ApiError> {
    let logs = ExecutionLog::fetch_for_execution(
        &state.db.pool,
        execution.id,
        query.after_line,
        query.limit,
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(logs)))
}

pub async fn execution_processes(
    Extension(execution): Extension<Execution>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<ExecutionProcess>>>, ApiError> {
    let processes = ExecutionProcess::find_by_execution(&state.db.pool, execution.id).await?;
    Ok(ResponseJson(ApiResponse::success(processes)))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let execution_id_router = Router::new()
        .route("/", get(get_execution))
        .route("/cancel", post(cancel_execution))
        .route("/logs", get(execution_logs))
        .route("/processes", get(execution_processes))
        .layer(from_fn_with_state(state.clone(), load_execution_middleware));

    let inner = Router::new()
        .route("/", get(list_executions))
        .nest("/{execution_id}", execution_id_router);

    Router::new().nest("/executions", inner)
}
