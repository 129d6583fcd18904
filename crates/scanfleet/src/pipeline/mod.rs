//! Task engine: lifecycle transitions, stage plans, and the hand-off to the
//! worker pool through the job queue.

mod fingerprint;
mod identify;
mod runner;
mod state;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use runner::StageRunner;
pub use state::Action;

use crate::{
    adapters::AdapterRegistry,
    config::AppConfig,
    db::{
        inventory::{self, TaskStatistics},
        results,
        tasks::{self, NewTask},
    },
    error::{Result, ScanError},
    jobs::{JobQueue, RateLimiter, StageJob},
    models::{LogLevel, Page, Task, TaskLog, TaskResult, TaskStatus, TaskType, ToolOptions},
    notify::{Notifier, StatusView, Subscription, TaskEvent},
    security::{in_scope, validate_options, TargetSpec},
};

/// Log entries replayed to a new live subscriber.
pub const REPLAY_LOGS: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PortScan,
    ServiceIdentify,
    Fingerprint,
    PocDetection,
    DirectoryScan,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PortScan => "port_scan",
            Stage::ServiceIdentify => "service_identify",
            Stage::Fingerprint => "fingerprint",
            Stage::PocDetection => "poc_detection",
            Stage::DirectoryScan => "directory_scan",
        }
    }
}

/// One stage and the progress window it reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStage {
    pub stage: Stage,
    pub start: i64,
    pub end: i64,
}

const fn planned(stage: Stage, start: i64, end: i64) -> PlannedStage {
    PlannedStage { stage, start, end }
}

pub fn plan(task_type: TaskType) -> Vec<PlannedStage> {
    match task_type {
        TaskType::Full => vec![
            planned(Stage::PortScan, 0, 33),
            planned(Stage::ServiceIdentify, 33, 66),
            planned(Stage::Fingerprint, 66, 99),
        ],
        TaskType::PortScan => vec![planned(Stage::PortScan, 0, 99)],
        TaskType::ServiceIdentify => vec![planned(Stage::ServiceIdentify, 0, 99)],
        TaskType::Fingerprint => vec![planned(Stage::Fingerprint, 0, 99)],
        TaskType::PocDetection => vec![planned(Stage::PocDetection, 0, 99)],
        TaskType::DirectoryScan => vec![planned(Stage::DirectoryScan, 0, 99)],
    }
}

/// External tools a task of this type will run, per the pipeline config.
pub fn plan_tools(cfg: &AppConfig, task_type: TaskType) -> Vec<String> {
    let mut tools = Vec::new();
    for planned in plan(task_type) {
        match planned.stage {
            Stage::PortScan => tools.push(cfg.pipeline.port_scanner.clone()),
            Stage::PocDetection => tools.extend(cfg.pipeline.poc_tools.iter().cloned()),
            Stage::DirectoryScan => tools.push(cfg.pipeline.dir_tool.clone()),
            Stage::ServiceIdentify | Stage::Fingerprint => {}
        }
    }
    tools
}

/// Writes task log entries and pushes them, with status changes, to live viewers.
#[derive(Clone)]
pub(crate) struct Reporter {
    pool: SqlitePool,
    notifier: Notifier,
}

impl Reporter {
    pub(crate) async fn log(&self, task_id: i64, level: LogLevel, message: &str) -> Result<()> {
        let entry = tasks::append_log(&self.pool, task_id, level, message).await?;
        self.notifier
            .broadcast(task_id, TaskEvent::Logs(vec![entry]))
            .await;
        Ok(())
    }

    pub(crate) async fn publish(&self, task_id: i64, event: TaskEvent) {
        self.notifier.broadcast(task_id, event).await;
    }

    pub(crate) async fn publish_status(&self, task_id: i64) {
        match tasks::get_task(&self.pool, task_id).await {
            Ok(Some(task)) => {
                self.publish(task_id, TaskEvent::Status(StatusView::from(&task)))
                    .await
            }
            Ok(None) => {}
            Err(e) => warn!(task_id, error = %e, "status lookup for broadcast failed"),
        }
    }

    /// RUNNING or PAUSED -> FAILED with an ERROR entry holding the raw error text.
    /// Viewers only get the public message.
    pub(crate) async fn fail(&self, task_id: i64, err: &ScanError) {
        error!(task_id, error = %err, "task failed");
        match tasks::transition(
            &self.pool,
            task_id,
            Action::Fail.allowed_from(),
            Action::Fail.target(),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(task_id, error = %e, "could not mark task failed");
                return;
            }
        }
        if let Err(e) = self
            .log(task_id, LogLevel::Error, &format!("Task failed: {err}"))
            .await
        {
            error!(task_id, error = %e, "could not write failure log");
        }
        self.publish(
            task_id,
            TaskEvent::Error {
                message: err.public_message(),
            },
        )
        .await;
        self.publish_status(task_id).await;
        self.publish(
            task_id,
            TaskEvent::Complete {
                status: TaskStatus::Failed,
            },
        )
        .await;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub name: String,
    pub task_type: TaskType,
    pub target: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub options: ToolOptions,
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: SqlitePool,
    queue: Arc<dyn JobQueue>,
    notifier: Notifier,
    registry: Arc<AdapterRegistry>,
    config: Arc<AppConfig>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    reporter: Reporter,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        queue: Arc<dyn JobQueue>,
        notifier: Notifier,
        registry: Arc<AdapterRegistry>,
        config: Arc<AppConfig>,
    ) -> Self {
        let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(
            config.task_rate_limit_per_minute,
        )));
        let reporter = Reporter {
            pool: pool.clone(),
            notifier: notifier.clone(),
        };
        Self {
            pool,
            queue,
            notifier,
            registry,
            config,
            rate_limiter,
            reporter,
        }
    }

    pub async fn create_task(&self, req: CreateTask) -> Result<Task> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ScanError::validation("task name is required"));
        }
        let priority = req.priority.unwrap_or(5);
        if !(1..=10).contains(&priority) {
            return Err(ScanError::validation("priority must be within 1..=10"));
        }
        let target = TargetSpec::parse(&req.target)?;
        if !in_scope(&target, &self.config.scope_allowlist) {
            return Err(ScanError::validation("target out of scope"));
        }
        validate_options(&req.options)?;
        for tool in plan_tools(&self.config, req.task_type) {
            let adapter = self.registry.get(&tool)?;
            if !adapter.accepts(target.kind()) {
                return Err(ScanError::validation(format!(
                    "{tool} does not accept this kind of target"
                )));
            }
        }

        if !self.rate_limiter.lock().await.allow() {
            return Err(ScanError::RateLimited);
        }

        let task = tasks::insert_task(
            &self.pool,
            &NewTask {
                name: name.to_string(),
                task_type: req.task_type,
                target: target.to_string(),
                priority,
                total_steps: plan(req.task_type).len() as i64,
                options: req.options,
            },
        )
        .await?;
        self.reporter
            .log(
                task.id,
                LogLevel::Info,
                &format!("Task created: {} against {}", task.task_type, task.target),
            )
            .await?;

        info!(task_id = task.id, task_type = %task.task_type, target = %task.target, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        tasks::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>> {
        tasks::list_tasks(&self.pool, status, limit.clamp(1, 500), offset.max(0)).await
    }

    /// PENDING -> RUNNING, then queue the stage plan. A task that cannot be
    /// queued ends FAILED before this returns.
    pub async fn start(&self, task_id: i64) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        Action::Start.check(task.status)?;

        for tool in plan_tools(&self.config, task.task_type) {
            let adapter = self.registry.get(&tool)?;
            if !adapter.installed() {
                warn!(task_id, tool = %tool, "cannot start: tool not installed");
                return Err(ScanError::ToolNotInstalled(tool));
            }
        }

        self.transition(task_id, Action::Start).await?;
        self.reporter
            .log(task_id, LogLevel::Info, "Task started")
            .await?;

        self.enqueue(&task, 0).await?;
        self.reporter.publish_status(task_id).await;
        info!(task_id, "task queued");
        self.get_task(task_id).await
    }

    /// Queues the stage plan of `task` from `from_stage`. A job that cannot
    /// be queued fails the task.
    async fn enqueue(&self, task: &Task, from_stage: usize) -> Result<()> {
        let job = StageJob {
            task_id: task.id,
            task_type: task.task_type,
            target: task.target.clone(),
            options: task.options.0.clone(),
            attempt: 0,
            from_stage,
        };
        if let Err(e) = self.queue.submit(job).await {
            self.reporter.fail(task.id, &e).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn pause(&self, task_id: i64) -> Result<Task> {
        self.apply(task_id, Action::Pause, "Task paused").await
    }

    /// PAUSED -> RUNNING. A job that parked while the task was paused is
    /// queued again from the stage it stopped before; one still executing
    /// simply carries on.
    pub async fn resume(&self, task_id: i64) -> Result<Task> {
        let task = self.apply(task_id, Action::Resume, "Task resumed").await?;
        let Some(stage) = tasks::take_parked(&self.pool, task_id).await? else {
            return Ok(task);
        };
        self.enqueue(&task, usize::try_from(stage).unwrap_or(0)).await?;
        info!(task_id, stage, "parked job queued again");
        self.get_task(task_id).await
    }

    pub async fn cancel(&self, task_id: i64) -> Result<Task> {
        let task = self.apply(task_id, Action::Cancel, "Task cancelled").await?;
        self.reporter
            .publish(
                task_id,
                TaskEvent::Complete {
                    status: TaskStatus::Cancelled,
                },
            )
            .await;
        Ok(task)
    }

    async fn apply(&self, task_id: i64, action: Action, message: &str) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        action.check(task.status)?;
        self.transition(task_id, action).await?;
        self.reporter.log(task_id, LogLevel::Info, message).await?;
        self.reporter.publish_status(task_id).await;
        info!(task_id, action = action.name(), "task transition");
        self.get_task(task_id).await
    }

    /// Compare-and-set; losing a race reports the state that won.
    async fn transition(&self, task_id: i64, action: Action) -> Result<()> {
        if tasks::transition(&self.pool, task_id, action.allowed_from(), action.target()).await? {
            return Ok(());
        }
        let from = tasks::get_status(&self.pool, task_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("task {task_id}")))?;
        Err(ScanError::IllegalTransition {
            action: action.name(),
            from,
        })
    }

    pub async fn logs(&self, task_id: i64, page: u32, page_size: u32) -> Result<Page<TaskLog>> {
        self.get_task(task_id).await?;
        tasks::logs_page(&self.pool, task_id, page, page_size).await
    }

    pub async fn results(&self, task_id: i64, tool: Option<&str>) -> Result<Vec<TaskResult>> {
        self.get_task(task_id).await?;
        results::list_task_results(&self.pool, task_id, tool).await
    }

    pub async fn statistics(&self, task_id: i64) -> Result<TaskStatistics> {
        self.get_task(task_id).await?;
        inventory::task_statistics(&self.pool, task_id).await
    }

    pub async fn status_event(&self, task_id: i64) -> Result<TaskEvent> {
        let task = self.get_task(task_id).await?;
        Ok(TaskEvent::Status(StatusView::from(&task)))
    }

    pub async fn logs_event(&self, task_id: i64) -> Result<TaskEvent> {
        let logs = tasks::recent_logs(&self.pool, task_id, REPLAY_LOGS).await?;
        Ok(TaskEvent::Logs(logs))
    }

    /// Live feed for one task, primed with its current status and recent log.
    pub async fn subscribe(&self, task_id: i64) -> Result<Subscription> {
        let status = self.status_event(task_id).await?;
        let logs = self.logs_event(task_id).await?;
        Ok(self.notifier.subscribe(task_id, vec![status, logs]).await)
    }

    pub async fn unsubscribe(&self, task_id: i64, subscriber: Uuid) {
        self.notifier.unsubscribe(task_id, subscriber).await;
    }

    pub(crate) fn reporter(&self) -> Reporter {
        self.reporter.clone()
    }
}
