use autodev_services::services::metrics::MetricsSnapshot;
use autodev_utils::response::ApiResponse;
use axum::{extract::State, response::Json};

use crate::state::AppState;

pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

pub async fn metrics(State(state): State<AppState>) -> Json<ApiResponse<MetricsSnapshot>> {
    Json(ApiResponse::success(state.metrics.snapshot()))
}
