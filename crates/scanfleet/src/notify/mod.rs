//! Per-task push channel. Publishers hold a cloned `Notifier`; viewers hold
//! a `Subscription` whose receiver is fed until it is dropped or falls behind.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::models::{Task, TaskLog, TaskStatus};

pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub task_id: i64,
    pub status: TaskStatus,
    pub progress: i64,
    pub current_step: Option<String>,
}

impl From<&Task> for StatusView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            current_step: task.current_step.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Status(StatusView),
    Logs(Vec<TaskLog>),
    Progress { progress: i64, step: Option<String> },
    Result(Value),
    Error { message: String },
    Complete { status: TaskStatus },
    Pong,
}

impl TaskEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Status(_) => "status",
            TaskEvent::Logs(_) => "logs",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::Result(_) => "result",
            TaskEvent::Error { .. } => "error",
            TaskEvent::Complete { .. } => "complete",
            TaskEvent::Pong => "pong",
        }
    }

    fn data(&self) -> Value {
        let data = match self {
            TaskEvent::Status(view) => serde_json::to_value(view),
            TaskEvent::Logs(logs) => serde_json::to_value(logs),
            TaskEvent::Progress { progress, step } => {
                Ok(serde_json::json!({ "progress": progress, "step": step }))
            }
            TaskEvent::Result(value) => Ok(value.clone()),
            TaskEvent::Error { message } => Ok(serde_json::json!({ "message": message })),
            TaskEvent::Complete { status } => Ok(serde_json::json!({ "status": status })),
            TaskEvent::Pong => Ok(Value::Null),
        };
        data.unwrap_or_default()
    }
}

/// Wire form of every pushed message: `{type, timestamp, data}`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl From<TaskEvent> for Envelope {
    fn from(event: TaskEvent) -> Self {
        Self {
            kind: event.kind(),
            timestamp: Utc::now(),
            data: event.data(),
        }
    }
}

pub struct Subscription {
    pub id: Uuid,
    pub task_id: i64,
    pub receiver: mpsc::Receiver<Envelope>,
}

type Registry = HashMap<i64, HashMap<Uuid, mpsc::Sender<Envelope>>>;

#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<RwLock<Registry>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a viewer. `replay` is queued ahead of any later broadcast.
    pub async fn subscribe(&self, task_id: i64, replay: Vec<TaskEvent>) -> Subscription {
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_BUFFER.max(replay.len() + 1));
        let id = Uuid::new_v4();

        let mut subscribers = self.subscribers.write().await;
        for event in replay {
            let _ = tx.try_send(event.into());
        }
        subscribers.entry(task_id).or_default().insert(id, tx);
        debug!(task_id, subscriber = %id, "subscriber added");

        Subscription {
            id,
            task_id,
            receiver,
        }
    }

    pub async fn unsubscribe(&self, task_id: i64, id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(viewers) = subscribers.get_mut(&task_id) {
            viewers.remove(&id);
            if viewers.is_empty() {
                subscribers.remove(&task_id);
            }
        }
    }

    /// Delivers to every viewer of the task and returns how many got it.
    /// A viewer whose channel is closed or full is dropped.
    pub async fn broadcast(&self, task_id: i64, event: TaskEvent) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let Some(viewers) = subscribers.get_mut(&task_id) else {
            return 0;
        };

        let envelope = Envelope::from(event);
        viewers.retain(|id, tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(task_id, subscriber = %id, "subscriber pruned");
                false
            }
        });

        let delivered = viewers.len();
        if viewers.is_empty() {
            subscribers.remove(&task_id);
        }
        delivered
    }

    pub async fn subscriber_count(&self, task_id: i64) -> usize {
        self.subscribers
            .read()
            .await
            .get(&task_id)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_viewer_of_the_task() {
        let notifier = Notifier::new();
        let mut a = notifier.subscribe(1, vec![]).await;
        let mut b = notifier.subscribe(1, vec![]).await;
        let mut other = notifier.subscribe(2, vec![]).await;

        let delivered = notifier
            .broadcast(1, TaskEvent::Progress { progress: 33, step: Some("port_scan".into()) })
            .await;
        assert_eq!(delivered, 2);

        let msg = a.receiver.recv().await.unwrap();
        assert_eq!(msg.kind, "progress");
        assert_eq!(msg.data["progress"], 33);
        assert_eq!(b.receiver.recv().await.unwrap().data["step"], "port_scan");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_viewer_is_pruned_without_affecting_others() {
        let notifier = Notifier::new();
        let gone = notifier.subscribe(7, vec![]).await;
        let mut alive = notifier.subscribe(7, vec![]).await;
        drop(gone);

        let delivered = notifier
            .broadcast(7, TaskEvent::Complete { status: TaskStatus::Completed })
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(notifier.subscriber_count(7).await, 1);
        assert_eq!(alive.receiver.recv().await.unwrap().data["status"], "completed");
    }

    #[tokio::test]
    async fn broadcasting_without_viewers_is_a_no_op() {
        let notifier = Notifier::new();
        assert_eq!(notifier.broadcast(3, TaskEvent::Pong).await, 0);
    }

    #[tokio::test]
    async fn replay_comes_before_live_events() {
        let notifier = Notifier::new();
        let mut sub = notifier
            .subscribe(
                4,
                vec![
                    TaskEvent::Status(StatusView {
                        task_id: 4,
                        status: TaskStatus::Running,
                        progress: 10,
                        current_step: None,
                    }),
                    TaskEvent::Logs(vec![]),
                ],
            )
            .await;
        notifier
            .broadcast(4, TaskEvent::Error { message: "boom".into() })
            .await;

        let kinds: Vec<_> = [
            sub.receiver.recv().await.unwrap(),
            sub.receiver.recv().await.unwrap(),
            sub.receiver.recv().await.unwrap(),
        ]
        .iter()
        .map(|m| m.kind)
        .collect();
        assert_eq!(kinds, ["status", "logs", "error"]);
    }

    #[tokio::test]
    async fn envelope_has_type_timestamp_and_data() {
        let envelope = Envelope::from(TaskEvent::Pong);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json["timestamp"].is_string());
        assert!(json["data"].is_null());
    }
}
