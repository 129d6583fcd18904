mod adapters;
mod api;
mod config;
mod db;
mod error;
mod fleet;
mod jobs;
mod models;
mod normalizer;
mod notify;
mod parser;
mod pipeline;
mod security;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    adapters::AdapterRegistry,
    config::AppConfig,
    fleet::FleetManager,
    jobs::{spawn_workers, sweeper_loop, InProcessQueue, JobRunnerState},
    normalizer::Normalizer,
    notify::Notifier,
    pipeline::{Orchestrator, StageRunner},
};

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub orchestrator: Orchestrator,
    pub fleet: FleetManager,
    pub registry: Arc<AdapterRegistry>,
    pub runner_state: Arc<Mutex<JobRunnerState>>,
    pub config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url)
        .await
        .context("open database")?;
    db::run_migrations(&pool).await.context("run migrations")?;

    let registry = Arc::new(AdapterRegistry::from_config(&config));
    for tool in registry.list_tools() {
        if !tool.installed {
            warn!(tool = tool.name, binary = %tool.binary, "enabled tool not found on PATH");
        }
    }

    let (queue, rx) = InProcessQueue::new(config.queue_capacity);
    let runner_state = Arc::new(Mutex::new(JobRunnerState::default()));
    let fleet = FleetManager::new(pool.clone());
    let orchestrator = Orchestrator::new(
        pool.clone(),
        Arc::new(queue),
        Notifier::new(),
        registry.clone(),
        config.clone(),
    );
    let runner = StageRunner::new(
        &orchestrator,
        fleet.clone(),
        Normalizer::new(pool.clone(), config.normalizer.port_exposure_findings),
    );

    spawn_workers(config.workers, rx, Arc::new(runner), runner_state.clone());
    tokio::spawn(sweeper_loop(
        fleet.clone(),
        orchestrator.clone(),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    ));

    let state = AppState {
        pool,
        orchestrator,
        fleet,
        registry,
        runner_state,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/api/health", get(api::health))
        .route("/api/nodes", get(api::list_nodes))
        .route("/api/nodes/register", post(api::register_node))
        .route("/api/nodes/stats", get(api::node_stats))
        .route("/api/nodes/{id}", delete(api::delete_node))
        .route("/api/nodes/{id}/heartbeat", post(api::node_heartbeat))
        .route("/api/nodes/{id}/health", get(api::node_health))
        .route("/api/nodes/{id}/maintenance", post(api::node_maintenance))
        .route("/api/tasks", get(api::list_tasks).post(api::create_task))
        .route("/api/tasks/{id}", get(api::get_task))
        .route("/api/tasks/{id}/start", post(api::start_task))
        .route("/api/tasks/{id}/pause", post(api::pause_task))
        .route("/api/tasks/{id}/resume", post(api::resume_task))
        .route("/api/tasks/{id}/cancel", post(api::cancel_task))
        .route("/api/tasks/{id}/logs", get(api::task_logs))
        .route("/api/tasks/{id}/results", get(api::task_results))
        .route("/api/tasks/{id}/stats", get(api::task_stats))
        .route("/api/tools", get(api::list_tools))
        .route("/api/tools/execute", post(api::execute_tool))
        .route("/api/assets", get(api::list_assets))
        .route("/api/vulnerabilities", get(api::list_vulnerabilities))
        .route(
            "/api/vulnerabilities/{id}/status",
            patch(api::update_vulnerability_status),
        )
        .route(
            "/api/vulnerabilities/{id}/history",
            get(api::vulnerability_history),
        )
        .route("/ws/tasks/{id}", get(api::task_socket))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, workers = config.workers, "scanfleet listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed");
    }
    info!("shutting down");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
