mod ws;

use std::fmt;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

pub use ws::task_socket;

use crate::{
    adapters::{Outcome, ToolInfo},
    db::inventory,
    error::ScanError,
    fleet::{FleetStatistics, Heartbeat, NodeHealth, RegisterNode, Registration},
    models::{
        Asset, Node, Page, Severity, Task, TaskLog, TaskResult, TaskStatus, ToolOptions,
        Vulnerability, VulnStatus, VulnerabilityHistory,
    },
    pipeline::CreateTask,
    AppState,
};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        let status = match &err {
            ScanError::Validation(_) | ScanError::ToolNotInstalled(_) => StatusCode::BAD_REQUEST,
            ScanError::IllegalTransition { .. } => StatusCode::CONFLICT,
            ScanError::NotFound(_) => StatusCode::NOT_FOUND,
            ScanError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ScanError::NodeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ScanError::ToolTimeout { .. } | ScanError::ToolFailed { .. } => StatusCode::BAD_GATEWAY,
            ScanError::Queue(_) | ScanError::Persistence(_) | ScanError::Migration(_) => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.public_message())
    }
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running = state.runner_state.lock().await.running;
    Json(json!({"status": "ok", "service": "scanfleet", "running_jobs": running}))
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

fn bounds(limit: i64, offset: i64) -> (i64, i64) {
    (limit.clamp(1, 500), offset.max(0))
}

// Nodes

pub async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNode>,
) -> ApiResult<Response> {
    Ok(match state.fleet.register(req).await? {
        Registration::Created(node) => (StatusCode::CREATED, Json(node)).into_response(),
        Registration::Existing(node) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": {
                    "message": format!("node {} already registered", node.name),
                    "status": StatusCode::CONFLICT.as_u16(),
                },
                "id": node.id,
            })),
        )
            .into_response(),
    })
}

pub async fn node_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(beat): Json<Heartbeat>,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.fleet.heartbeat(id, beat).await?))
}

pub async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.fleet.list().await?))
}

pub async fn node_stats(State(state): State<AppState>) -> ApiResult<Json<FleetStatistics>> {
    Ok(Json(state.fleet.statistics().await?))
}

pub async fn node_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<NodeHealth>> {
    Ok(Json(state.fleet.health(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

pub async fn node_maintenance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<MaintenanceRequest>,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.fleet.set_maintenance(id, req.enabled).await?))
}

pub async fn delete_node(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.fleet.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Tasks

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.create_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
pub struct TaskFilter {
    status: Option<TaskStatus>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<Json<Vec<Task>>> {
    let (limit, offset) = bounds(filter.limit, filter.offset);
    Ok(Json(
        state
            .orchestrator
            .list_tasks(filter.status, limit, offset)
            .await?,
    ))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.get_task(id).await?))
}

pub async fn start_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.start(id).await?))
}

pub async fn pause_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.pause(id).await?))
}

pub async fn resume_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.resume(id).await?))
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.cancel(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn first_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

pub async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Page<TaskLog>>> {
    Ok(Json(
        state
            .orchestrator
            .logs(id, query.page, query.page_size)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    tool: Option<String>,
}

pub async fn task_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ResultQuery>,
) -> ApiResult<Json<Vec<TaskResult>>> {
    Ok(Json(
        state
            .orchestrator
            .results(id, query.tool.as_deref())
            .await?,
    ))
}

pub async fn task_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<inventory::TaskStatistics>> {
    Ok(Json(state.orchestrator.statistics(id).await?))
}

// Tools

pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    Json(state.registry.list_tools())
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolRequest {
    tool: String,
    target: String,
    #[serde(default)]
    options: ToolOptions,
}

pub async fn execute_tool(
    State(state): State<AppState>,
    Json(req): Json<ExecuteToolRequest>,
) -> ApiResult<Json<Outcome>> {
    let outcome = state
        .registry
        .execute(
            &req.tool,
            &req.target,
            &req.options,
            &state.config.scope_allowlist,
        )
        .await?;
    Ok(Json(outcome))
}

// Inventory

pub async fn list_assets(
    State(state): State<AppState>,
    Query(paging): Query<Paging>,
) -> ApiResult<Json<Vec<Asset>>> {
    let (limit, offset) = bounds(paging.limit, paging.offset);
    Ok(Json(inventory::list_assets(&state.pool, limit, offset).await?))
}

#[derive(Debug, Deserialize)]
pub struct VulnerabilityFilter {
    severity: Option<Severity>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

pub async fn list_vulnerabilities(
    State(state): State<AppState>,
    Query(filter): Query<VulnerabilityFilter>,
) -> ApiResult<Json<Vec<Vulnerability>>> {
    let (limit, offset) = bounds(filter.limit, filter.offset);
    Ok(Json(
        inventory::list_vulnerabilities(&state.pool, filter.severity, limit, offset).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct VulnerabilityStatusRequest {
    status: VulnStatus,
    #[serde(default)]
    note: Option<String>,
}

pub async fn update_vulnerability_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<VulnerabilityStatusRequest>,
) -> ApiResult<Json<Vulnerability>> {
    Ok(Json(
        inventory::update_vulnerability_status(&state.pool, id, req.status, req.note.as_deref())
            .await?,
    ))
}

pub async fn vulnerability_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<VulnerabilityHistory>>> {
    Ok(Json(inventory::vulnerability_history(&state.pool, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses_with_generic_internal_messages() {
        let cases = [
            (ScanError::validation("bad target"), StatusCode::BAD_REQUEST),
            (
                ScanError::IllegalTransition {
                    action: "pause",
                    from: TaskStatus::Pending,
                },
                StatusCode::CONFLICT,
            ),
            (ScanError::NotFound("task 9".into()), StatusCode::NOT_FOUND),
            (ScanError::ToolNotInstalled("nmap".into()), StatusCode::BAD_REQUEST),
            (ScanError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (
                ScanError::Persistence(sqlx::Error::PoolTimedOut),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }

        let internal = ApiError::from(ScanError::Queue("redis://secret@host".into()));
        assert_eq!(internal.message, "internal error");
    }

    #[test]
    fn paging_is_bounded() {
        assert_eq!(bounds(10_000, -3), (500, 0));
        assert_eq!(bounds(0, 20), (1, 20));
    }
}
