use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::{fingerprint, identify, plan, Action, Orchestrator, PlannedStage, Reporter, Stage};
use crate::{
    adapters::{AdapterRegistry, OutcomeStatus},
    config::AppConfig,
    db::{
        inventory::{self, ServiceWithAddress},
        tasks,
    },
    error::{Result, ScanError},
    fleet::FleetManager,
    jobs::{JobHandler, JobQueue, StageJob},
    models::{LogLevel, Node, TaskStatus, TaskType},
    normalizer::Normalizer,
    notify::TaskEvent,
    security::TargetSpec,
};

/// What one stage produced, pushed to viewers as a `result` message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub tools: Vec<String>,
    pub services_found: usize,
    pub vulnerabilities_found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage: stage.as_str(),
            ..Default::default()
        }
    }

    fn summary(&self) -> String {
        format!(
            "{} services, {} vulnerabilities",
            self.services_found, self.vulnerabilities_found
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Proceed,
    Parked,
    Stopped,
}

/// Worker-side execution of queued stage plans.
#[derive(Clone)]
pub struct StageRunner {
    pool: SqlitePool,
    fleet: FleetManager,
    normalizer: Normalizer,
    registry: Arc<AdapterRegistry>,
    queue: Arc<dyn JobQueue>,
    config: Arc<AppConfig>,
    reporter: Reporter,
}

impl StageRunner {
    pub fn new(orchestrator: &Orchestrator, fleet: FleetManager, normalizer: Normalizer) -> Self {
        Self {
            pool: orchestrator.pool.clone(),
            fleet,
            normalizer,
            registry: orchestrator.registry.clone(),
            queue: orchestrator.queue.clone(),
            config: orchestrator.config.clone(),
            reporter: orchestrator.reporter(),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.pipeline.cancel_poll_millis.max(10))
    }

    /// Whether the job may go on before plan index `stage`. A paused task
    /// parks the job there and frees the worker; resume queues it again.
    async fn gate(&self, task_id: i64, stage: usize) -> Result<Gate> {
        loop {
            match tasks::get_status(&self.pool, task_id).await? {
                Some(TaskStatus::Running) => return Ok(Gate::Proceed),
                Some(TaskStatus::Paused) => {
                    let index = i64::try_from(stage).unwrap_or(i64::MAX);
                    if tasks::park(&self.pool, task_id, index).await? {
                        info!(task_id, stage, "job parked while task is paused");
                        return Ok(Gate::Parked);
                    }
                    // resumed or cancelled in between; read it again
                }
                _ => return Ok(Gate::Stopped),
            }
        }
    }

    /// Resolves once the task is cancelled or gone.
    async fn cancelled(&self, task_id: i64) {
        let mut ticker = tokio::time::interval(self.poll_interval());
        loop {
            ticker.tick().await;
            match tasks::get_status(&self.pool, task_id).await {
                Ok(Some(TaskStatus::Cancelled)) | Ok(None) => return,
                Ok(Some(_)) => {}
                Err(e) => warn!(task_id, error = %e, "cancel watcher status read failed"),
            }
        }
    }

    /// Runs `work` unless the task is cancelled first. Losing the race drops
    /// `work`, which kills any tool process it spawned.
    async fn guarded<T>(&self, task_id: i64, work: impl Future<Output = Result<T>>) -> Result<Option<T>> {
        tokio::select! {
            res = work => res.map(Some),
            _ = self.cancelled(task_id) => {
                info!(task_id, "stage aborted by cancellation");
                Ok(None)
            }
        }
    }

    async fn reserve_node(&self, job: &StageJob) -> Result<Option<Node>> {
        match self.fleet.acquire(job.task_type).await? {
            Some(node) => {
                tasks::set_assigned_node(&self.pool, job.task_id, Some(node.id)).await?;
                self.reporter
                    .log(
                        job.task_id,
                        LogLevel::Info,
                        &format!("Assigned to node {}", node.name),
                    )
                    .await?;
                Ok(Some(node))
            }
            None if self.config.pipeline.require_node => Err(ScanError::NodeUnavailable),
            None => {
                debug!(task_id = job.task_id, "no node free, running on the local pool");
                Ok(None)
            }
        }
    }

    /// Re-queues the job after `node_retry_secs`. Only the first deferral is logged.
    async fn defer(&self, job: StageJob) -> Result<()> {
        let secs = self.config.pipeline.node_retry_secs;
        if job.attempt == 0 {
            self.reporter
                .log(
                    job.task_id,
                    LogLevel::Warning,
                    &format!("No node available; retrying every {secs}s"),
                )
                .await?;
        }
        debug!(task_id = job.task_id, attempt = job.attempt, "job deferred");

        let runner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let task_id = job.task_id;
            let next = StageJob {
                attempt: job.attempt + 1,
                ..job
            };
            if let Err(e) = runner.queue.submit(next).await {
                runner.reporter.fail(task_id, &e).await;
            }
        });
        Ok(())
    }

    async fn run(&self, job: StageJob) -> Result<()> {
        if self.gate(job.task_id, job.from_stage).await? != Gate::Proceed {
            debug!(task_id = job.task_id, "job not run, task is not running");
            return Ok(());
        }

        let node = match self.reserve_node(&job).await {
            Ok(node) => node,
            Err(ScanError::NodeUnavailable) => return self.defer(job).await,
            Err(e) => return Err(e),
        };

        let result = self.run_stages(&job).await;
        if let Some(node) = node {
            if let Err(e) = self.fleet.release(node.id).await {
                warn!(node_id = node.id, error = %e, "node slot release failed");
            }
        }
        result
    }

    async fn run_stages(&self, job: &StageJob) -> Result<()> {
        let task_id = job.task_id;
        let target = TargetSpec::parse(&job.target)?;

        let stages = plan(job.task_type);
        let total = stages.len();
        for (index, PlannedStage { stage, start, end }) in
            stages.into_iter().enumerate().skip(job.from_stage)
        {
            if self.gate(task_id, index).await? != Gate::Proceed {
                info!(task_id, stage = stage.as_str(), "job left before stage");
                return Ok(());
            }

            let step = stage.as_str();
            tasks::set_progress(&self.pool, task_id, start, Some(step)).await?;
            self.reporter
                .log(task_id, LogLevel::Info, &format!("Stage {step} started"))
                .await?;
            self.progress(task_id, start, step).await;

            let Some(report) = self
                .guarded(task_id, self.run_stage(stage, job, &target))
                .await?
            else {
                return Ok(());
            };

            tasks::set_progress(&self.pool, task_id, end, Some(step)).await?;
            self.reporter
                .log(
                    task_id,
                    LogLevel::Info,
                    &format!("Stage {step} finished: {}", report.summary()),
                )
                .await?;
            self.progress(task_id, end, step).await;
            self.reporter
                .publish(
                    task_id,
                    TaskEvent::Result(serde_json::to_value(&report).unwrap_or_default()),
                )
                .await;

            if let Some(note) = report.note {
                return self.finish(task_id, total, Some(note)).await;
            }
        }
        self.finish(task_id, total, None).await
    }

    /// Completes the task once nothing is left to run. A pause that lands
    /// after the last stage parks the job past the end of the plan.
    async fn finish(&self, task_id: i64, total: usize, note: Option<String>) -> Result<()> {
        loop {
            if self.gate(task_id, total).await? != Gate::Proceed {
                return Ok(());
            }
            if self.complete(task_id, note.as_deref()).await? {
                return Ok(());
            }
        }
    }

    async fn progress(&self, task_id: i64, progress: i64, step: &str) {
        self.reporter
            .publish(
                task_id,
                TaskEvent::Progress {
                    progress,
                    step: Some(step.to_string()),
                },
            )
            .await;
    }

    async fn run_stage(&self, stage: Stage, job: &StageJob, target: &TargetSpec) -> Result<StageReport> {
        let mut report = StageReport::new(stage);
        match stage {
            Stage::PortScan => {
                let tool = self.config.pipeline.port_scanner.clone();
                self.run_tool(&tool, job, target, &mut report).await?;
                if report.services_found == 0 {
                    report.note = Some("No open ports found".to_string());
                }
            }
            Stage::PocDetection => {
                for tool in &self.config.pipeline.poc_tools {
                    self.run_tool(tool, job, target, &mut report).await?;
                }
            }
            Stage::DirectoryScan => {
                let tool = self.config.pipeline.dir_tool.clone();
                self.run_tool(&tool, job, target, &mut report).await?;
            }
            Stage::ServiceIdentify => {
                let services = self.services_in_scope(job, target).await?;
                let identified = identify::run(&self.pool, job.task_id, &services).await?;
                report.tools.push(identify::TOOL_NAME.to_string());
                report.services_found = identified.examined;
            }
            Stage::Fingerprint => {
                let services = self.services_in_scope(job, target).await?;
                let matched = fingerprint::run(&self.pool, job.task_id, &services).await?;
                report.tools.push(fingerprint::TOOL_NAME.to_string());
                report.services_found = matched.examined;
                report.vulnerabilities_found = matched.matches.len();
            }
        }
        Ok(report)
    }

    /// Runs one adapter and normalizes what it found. An error outcome is
    /// stored like any other, then fails the stage.
    async fn run_tool(
        &self,
        tool: &str,
        job: &StageJob,
        target: &TargetSpec,
        report: &mut StageReport,
    ) -> Result<()> {
        let adapter = self.registry.get(tool)?;
        let outcome = adapter.execute(target, &job.options).await;
        let summary = self.normalizer.normalize(job.task_id, &outcome).await?;
        report.tools.push(outcome.tool.clone());
        report.services_found += summary.services_found;
        report.vulnerabilities_found += summary.vulnerabilities_found;

        let reason = outcome.reason.clone().unwrap_or_default();
        match outcome.status {
            OutcomeStatus::Success => Ok(()),
            OutcomeStatus::Warning => {
                self.reporter
                    .log(
                        job.task_id,
                        LogLevel::Warning,
                        &format!("{tool} finished with warnings: {reason}"),
                    )
                    .await
            }
            OutcomeStatus::Error => Err(ScanError::ToolFailed {
                tool: tool.to_string(),
                reason,
            }),
        }
    }

    /// Composite tasks work on what their own port scan found; single-stage
    /// tasks on the inventory inside their target.
    async fn services_in_scope(&self, job: &StageJob, target: &TargetSpec) -> Result<Vec<ServiceWithAddress>> {
        if job.task_type == TaskType::Full {
            return inventory::services_for_task(&self.pool, job.task_id).await;
        }
        Ok(inventory::open_services(&self.pool)
            .await?
            .into_iter()
            .filter(|s| target.contains(&s.address))
            .collect())
    }

    /// RUNNING -> COMPLETED. False when the task left RUNNING first.
    async fn complete(&self, task_id: i64, note: Option<&str>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !tasks::transition(
            &mut *tx,
            task_id,
            Action::Complete.allowed_from(),
            Action::Complete.target(),
        )
        .await?
        {
            debug!(task_id, "task left running before completion");
            return Ok(false);
        }
        tasks::set_progress(&mut *tx, task_id, 100, Some("finalize")).await?;
        let message = match note {
            Some(note) => format!("Task completed: {note}"),
            None => "Task completed".to_string(),
        };
        let entry = tasks::append_log(&mut *tx, task_id, LogLevel::Info, &message).await?;
        tx.commit().await?;

        info!(task_id, "task completed");
        self.reporter
            .publish(task_id, TaskEvent::Logs(vec![entry]))
            .await;
        self.progress(task_id, 100, "finalize").await;
        self.reporter.publish_status(task_id).await;
        self.reporter
            .publish(
                task_id,
                TaskEvent::Complete {
                    status: TaskStatus::Completed,
                },
            )
            .await;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl JobHandler for StageRunner {
    async fn handle(&self, job: StageJob) {
        let task_id = job.task_id;
        if let Err(e) = self.run(job).await {
            self.reporter.fail(task_id, &e).await;
        }
    }
}
