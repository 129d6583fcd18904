use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, ScanError},
    fleet::{FleetManager, SweepReport},
    models::{TaskType, ToolOptions},
    pipeline::Orchestrator,
};

/// One unit of queued work: run the stage plan of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub task_id: i64,
    pub task_type: TaskType,
    pub target: String,
    pub options: ToolOptions,
    pub attempt: u32,
    /// Index into the stage plan to start from; non-zero for a job queued
    /// again after its task was paused.
    #[serde(default)]
    pub from_stage: usize,
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Fails when the job could not be queued; nothing is retried here.
    async fn submit(&self, job: StageJob) -> Result<()>;
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: StageJob);
}

/// Bounded in-process queue feeding the worker pool.
#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::Sender<StageJob>,
}

impl InProcessQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StageJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl JobQueue for InProcessQueue {
    async fn submit(&self, job: StageJob) -> Result<()> {
        let task_id = job.task_id;
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ScanError::Queue("queue is full".into()),
            mpsc::error::TrySendError::Closed(_) => ScanError::Queue("queue is closed".into()),
        })?;
        debug!(task_id, "job queued");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct JobRunnerState {
    pub running: usize,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit_per_minute: usize,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: usize) -> Self {
        Self {
            limit_per_minute,
            requests: VecDeque::new(),
        }
    }

    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.requests.len() >= self.limit_per_minute {
            return false;
        }
        self.requests.push_back(now);
        true
    }
}

/// Starts `workers` loops sharing one receiver. Jobs run in parallel across
/// workers; each worker takes the next job once its current one is done.
pub fn spawn_workers(
    workers: usize,
    rx: mpsc::Receiver<StageJob>,
    handler: Arc<dyn JobHandler>,
    runner_state: Arc<Mutex<JobRunnerState>>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                rx.clone(),
                handler.clone(),
                runner_state.clone(),
            ))
        })
        .collect()
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<StageJob>>>,
    handler: Arc<dyn JobHandler>,
    runner_state: Arc<Mutex<JobRunnerState>>,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(job) = next else {
            debug!(worker, "queue closed, worker exiting");
            break;
        };

        {
            let mut lock = runner_state.lock().await;
            lock.running += 1;
        }
        debug!(worker, task_id = job.task_id, attempt = job.attempt, "job picked up");
        handler.handle(job).await;
        decrement_running(&runner_state).await;
    }
}

async fn decrement_running(runner_state: &Arc<Mutex<JobRunnerState>>) {
    let mut lock = runner_state.lock().await;
    lock.running = lock.running.saturating_sub(1);
}

/// One offline sweep. Tasks taken back from dead nodes are started again so
/// they get queued elsewhere.
pub async fn sweep_once(fleet: &FleetManager, orchestrator: &Orchestrator) -> Result<SweepReport> {
    let report = fleet.sweep_offline().await?;
    if !report.nodes_offline.is_empty() {
        info!(
            nodes = ?report.nodes_offline,
            tasks = ?report.requeued_tasks,
            "offline sweep reassigned work"
        );
    }
    for &task_id in &report.requeued_tasks {
        if let Err(e) = orchestrator.start(task_id).await {
            warn!(task_id, error = %e, "failed to restart requeued task");
        }
    }
    Ok(report)
}

pub async fn sweeper_loop(fleet: FleetManager, orchestrator: Orchestrator, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&fleet, &orchestrator).await {
            error!(error = %e, "node sweep failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex as StdMutex;

    use super::*;

    pub struct FailingQueue;

    #[async_trait::async_trait]
    impl JobQueue for FailingQueue {
        async fn submit(&self, _job: StageJob) -> Result<()> {
            Err(ScanError::Queue("broker unreachable".into()))
        }
    }

    /// Keeps submitted jobs for inspection instead of running them.
    #[derive(Default)]
    pub struct RecordingQueue {
        pub jobs: StdMutex<Vec<StageJob>>,
    }

    impl RecordingQueue {
        pub fn submitted(&self) -> Vec<StageJob> {
            self.jobs.lock().expect("jobs lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl JobQueue for RecordingQueue {
        async fn submit(&self, job: StageJob) -> Result<()> {
            self.jobs.lock().expect("jobs lock").push(job);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn job(task_id: i64) -> StageJob {
        StageJob {
            task_id,
            task_type: TaskType::PortScan,
            target: "10.0.0.1".into(),
            options: ToolOptions::default(),
            attempt: 0,
            from_stage: 0,
        }
    }

    #[test]
    fn rate_limiter_caps_requests_per_minute() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let (queue, _rx) = InProcessQueue::new(1);
        queue.submit(job(1)).await.unwrap();
        let err = queue.submit(job(2)).await.unwrap_err();
        assert!(matches!(err, ScanError::Queue(_)));
    }

    #[tokio::test]
    async fn closed_queue_rejects_submission() {
        let (queue, rx) = InProcessQueue::new(4);
        drop(rx);
        assert!(queue.submit(job(1)).await.is_err());
    }

    struct CountingHandler(AtomicUsize);

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: StageJob) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_exit_when_closed() {
        let (queue, rx) = InProcessQueue::new(8);
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let state = Arc::new(Mutex::new(JobRunnerState::default()));
        let workers = spawn_workers(3, rx, handler.clone(), state.clone());

        for id in 0..5 {
            queue.submit(job(id)).await.unwrap();
        }
        drop(queue);
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(handler.0.load(Ordering::SeqCst), 5);
        assert_eq!(state.lock().await.running, 0);
    }
}
