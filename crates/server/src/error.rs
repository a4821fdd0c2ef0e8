use autodev_db::models::{
    execution::ExecutionError, plan::PlanError, project::ProjectError, task::TaskError,
    worktree::WorktreeRowError,
};
use autodev_services::services::{
    dispatcher::DispatchError, github::ProviderError, status::StatusError,
    worktree_manager::WorktreeError,
};
use autodev_utils::response::ApiResponse;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    WorktreeRow(#[from] WorktreeRowError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,

            ApiError::Project(ProjectError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Project(ProjectError::DuplicateName(_)) => StatusCode::CONFLICT,
            ApiError::Project(ProjectError::Validation(_)) => StatusCode::BAD_REQUEST,

            ApiError::Task(TaskError::NotFound | TaskError::ProjectNotFound) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Task(TaskError::DuplicateTitle(_)) => StatusCode::CONFLICT,
            ApiError::Task(TaskError::Validation(_)) => StatusCode::BAD_REQUEST,

            ApiError::Plan(
                PlanError::NotFound | PlanError::TaskNotFound | PlanError::VersionNotFound(_),
            ) => StatusCode::NOT_FOUND,
            ApiError::Plan(PlanError::Validation(_)) => StatusCode::BAD_REQUEST,

            ApiError::Execution(ExecutionError::NotFound | ExecutionError::TaskNotFound) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Execution(ExecutionError::AlreadyActive) => StatusCode::CONFLICT,
            ApiError::Execution(ExecutionError::Validation(_)) => StatusCode::BAD_REQUEST,

            ApiError::WorktreeRow(
                WorktreeRowError::DuplicateBranch(_) | WorktreeRowError::DuplicatePath(_),
            ) => StatusCode::CONFLICT,
            ApiError::WorktreeRow(WorktreeRowError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Worktree(WorktreeError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Worktree(WorktreeError::Row(
                WorktreeRowError::DuplicateBranch(_) | WorktreeRowError::DuplicatePath(_),
            )) => StatusCode::CONFLICT,

            ApiError::Status(StatusError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            ApiError::Status(StatusError::TaskNotFound | StatusError::PlanNotFound) => {
                StatusCode::NOT_FOUND
            }

            ApiError::Dispatch(DispatchError::CapacityExhausted { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Dispatch(
                DispatchError::TaskNotFound
                | DispatchError::ProjectNotFound
                | DispatchError::ExecutionNotFound
                | DispatchError::PlanNotFound,
            ) => StatusCode::NOT_FOUND,
            ApiError::Dispatch(DispatchError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(DispatchError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Dispatch(DispatchError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Dispatch(DispatchError::Status(StatusError::InvalidTransition { .. })) => {
                StatusCode::CONFLICT
            }
            ApiError::Dispatch(DispatchError::Status(
                StatusError::TaskNotFound | StatusError::PlanNotFound,
            )) => StatusCode::NOT_FOUND,
            ApiError::Dispatch(DispatchError::Execution(ExecutionError::AlreadyActive)) => {
                StatusCode::CONFLICT
            }
            ApiError::Dispatch(DispatchError::Provider(_)) => StatusCode::BAD_GATEWAY,

            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,

            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error on request: {self}");
        }
        let body: ApiResponse<()> = ApiResponse::error(self.to_string());
        (status, Json(body)).into_response()
    }
}
