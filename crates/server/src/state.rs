use std::sync::Arc;

use autodev_db::DbService;
use autodev_services::services::{
    config::Config, dispatcher::Dispatcher, events::EventBus, metrics::MetricsService,
    pr_monitor::PrMonitorService, status::StatusService, worktree_manager::WorktreeManager,
};

/// Handles the HTTP/WS layer needs. Constructed once in `main` after the
/// components are wired in dependency order; routes never reach around it.
#[derive(Clone)]
pub struct AppState {
    pub db: DbService,
    pub config: Arc<Config>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<MetricsService>,
    pub status: Arc<StatusService>,
    pub dispatcher: Arc<Dispatcher>,
    pub worktrees: Arc<WorktreeManager>,
    pub pr_monitor: Arc<PrMonitorService>,
}
