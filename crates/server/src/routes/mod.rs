pub mod executions;
pub mod health;
pub mod plans;
pub mod projects;
pub mod tasks;
pub mod webhooks;
pub mod worktrees;
pub mod ws;

use axum::{Router, routing::get};

use crate::state::AppState;

/// Full application router: REST under `/api/v1`, WebSocket push at `/ws`,
/// liveness at `/health`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(projects::router(&state))
        .merge(tasks::router(&state))
        .merge(plans::router(&state))
        .merge(executions::router(&state))
        .merge(worktrees::router(&state))
        .merge(webhooks::router())
        .route("/metrics", get(health::metrics));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health::health_check))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Router serving only the WebSocket endpoint, for a dedicated listener.
pub fn ws_only_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
