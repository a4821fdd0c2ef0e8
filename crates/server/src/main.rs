use std::{sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::{execution::Execution, execution_log::ExecutionLog},
};
use autodev_server::{routes, state::AppState};
use autodev_services::services::{
    config::Config,
    dispatcher::Dispatcher,
    events::EventBus,
    github::{DisabledProvider, GithubService, RepoProvider},
    log_pipeline::{LogPipeline, LogPipelineConfig},
    metrics::MetricsService,
    pr_monitor::PrMonitorService,
    status::StatusService,
    supervisor::ProcessSupervisor,
    worktree_manager::WorktreeManager,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.worktree_base_dir).await?;

    let db = DbService::new(&config.database_path()).await?;
    tracing::info!("database ready at {}", config.database_path().display());

    // components in dependency order; each gets only the handles it needs
    let events = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsService::new());
    let status = Arc::new(StatusService::new(
        db.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new(
        db.clone(),
        config.grace_period,
        config.process_sample_interval,
    ));
    let worktrees = Arc::new(WorktreeManager::new(
        db.clone(),
        config.worktree_base_dir.clone(),
    ));
    let pipeline = Arc::new(LogPipeline::new(
        db.clone(),
        events.clone(),
        LogPipelineConfig {
            batch_size: config.log_batch_size,
            batch_interval: config.log_batch_interval,
            ..LogPipelineConfig::default()
        },
    ));
    let provider: Arc<dyn RepoProvider> = match &config.repo_provider_token {
        Some(token) => Arc::new(GithubService::new(
            token,
            config.repo_provider_base_url.as_deref(),
        )?),
        None => {
            tracing::warn!("no repo provider token configured; pull requests are disabled");
            Arc::new(DisabledProvider)
        }
    };

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        db.clone(),
        config.clone(),
        events.clone(),
        status.clone(),
        supervisor.clone(),
        worktrees.clone(),
        provider.clone(),
        pipeline,
        metrics.clone(),
        shutdown.clone(),
    );
    let pr_monitor = Arc::new(PrMonitorService::new(
        db.clone(),
        provider,
        status.clone(),
        worktrees.clone(),
        events.clone(),
        metrics.clone(),
        config.pr_poll_interval,
    ));

    // reconcile executions a previous run left behind
    let recovered = dispatcher.recover_orphans().await?;
    if recovered > 0 {
        tracing::info!("recovered {recovered} orphaned executions");
    }

    // background workers
    let workers = CancellationToken::new();
    let monitor_handle = pr_monitor.clone().spawn(workers.clone());
    let sweep_handle = worktrees.clone().spawn_sweep(
        Duration::from_secs(3600),
        config.worktree_retention,
        workers.clone(),
    );
    let retention_handle = spawn_log_retention(db.clone(), config.clone(), workers.clone());

    let app_state = AppState {
        db,
        config: config.clone(),
        events,
        metrics,
        status,
        dispatcher: dispatcher.clone(),
        worktrees,
        pr_monitor,
    };

    let app = routes::router(app_state.clone());
    let listener = tokio::net::TcpListener::bind(&config.http_listen_addr).await?;
    tracing::info!("listening on http://{}", config.http_listen_addr);

    // optional dedicated websocket listener
    let ws_server = match &config.ws_listen_addr {
        Some(addr) if *addr != config.http_listen_addr => {
            let ws_listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("websocket listener on ws://{addr}/ws");
            let ws_app = routes::ws_only_router(app_state);
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(ws_listener, ws_app)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            }))
        }
        _ => None,
    };

    let serve_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_token.cancel();
        })
        .await?;

    // drain: running executions get a graceful cancel, pipelines flush,
    // workers stop; anything slower than the timeout is abandoned
    tracing::info!("shutting down");
    dispatcher.shutdown_gracefully().await;
    supervisor.shutdown(config.grace_period + Duration::from_secs(5)).await;
    workers.cancel();
    let _ = monitor_handle.await;
    let _ = sweep_handle.await;
    let _ = retention_handle.await;
    if let Some(ws_server) = ws_server {
        let _ = ws_server.await;
    }
    tracing::info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Hourly retention pass: hard-delete finished executions (and their
/// processes/logs via cascade) past the retention window, plus any stray
/// log rows older than the cutoff.
fn spawn_log_retention(
    db: DbService,
    config: Arc<Config>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(config.log_retention_days);
                    match Execution::cleanup_older_than(&db.pool, cutoff).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("retention removed {n} old executions"),
                        Err(e) => tracing::warn!("execution retention pass failed: {e}"),
                    }
                    match ExecutionLog::delete_older_than(&db.pool, cutoff).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("retention removed {n} old log rows"),
                        Err(e) => tracing::warn!("log retention pass failed: {e}"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
