use autodev_db::models::{
    project::{CreateProject, Project, UpdateProject},
    task::Task,
};
use autodev_utils::response::ApiResponse;
use axum::{
    Extension, Json, Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json as ResponseJson,
    routing::{get, post},
};
use uuid::Uuid;

use crate::{error::ApiError, middleware::load_project_middleware, state::AppState};

pub async fn list_projects(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Vec<Project>>>, ApiError> {
    let projects = Project::fetch_all(&state.db.pool).await?;
    Ok(ResponseJson(ApiResponse::success(projects)))
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(payload): Json<CreateProject>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<Project>>), ApiError> {
    // the path must be a usable repository before anything is persisted
    let git = autodev_services::services::git::GitService::new();
    git.open_repo(std::path::Path::new(&payload.git_repo_path))
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let project = Project::create(&state.db.pool, &payload, Uuid::new_v4()).await?;
    tracing::info!("created project '{}' ({})", project.name, project.id);
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(project))))
}

pub async fn get_project(
    Extension(project): Extension<Project>,
) -> ResponseJson<ApiResponse<Project>> {
    ResponseJson(ApiResponse::success(project))
}

pub async fn update_project(
    Extension(project): Extension<Project>,
    State(state): State<AppState>,
    Json(payload): Json<UpdateProject>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = Project::update(&state.db.pool, project.id, &payload).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

/// Archive (soft-delete); tasks and their children stay on disk for audit.
pub async fn archive_project(
    Extension(project): Extension<Project>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    Project::archive(&state.db.pool, project.id).await?;
    tracing::info!("archived project {}", project.id);
    Ok(ResponseJson(ApiResponse::success(())))
}

pub async fn restore_project(
    Extension(project): Extension<Project>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<Project>>, ApiError> {
    let project = Project::restore(&state.db.pool, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(project)))
}

/// Board-style listing with execution flags for every task in the project.
pub async fn project_tasks(
    Extension(project): Extension<Project>,
    State(state): State<AppState>,
) -> Result<
    ResponseJson<ApiResponse<Vec<autodev_db::models::task::TaskWithExecutionStatus>>>,
    ApiError,
> {
    let tasks = Task::fetch_all_with_status(&state.db.pool, project.id).await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub fn router(state: &AppState) -> Router<AppState> {
    let project_id_router = Router::new()
        .route(
            "/",
            get(get_project).put(update_project).delete(archive_project),
        )
        .route("/restore", post(restore_project))
        .route("/tasks", get(project_tasks))
        .layer(from_fn_with_state(state.clone(), load_project_middleware));

    let inner = Router::new()
        .route("/", get(list_projects).post(create_project))
        .nest("/{project_id}", project_id_router);

    Router::new().nest("/projects", inner)
}
