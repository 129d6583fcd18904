//! Execution-node registry: registration, heartbeats, capacity-aware
//! selection and offline detection. Slot counts live in the store and are
//! only changed by conditional updates, so several processes can share it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::{
    db::{
        nodes::{self, NewNode, ResourceGauges},
        tasks,
    },
    error::{Result, ScanError},
    models::{LogLevel, Node, NodeStatus, NodeType, TaskType},
};

/// Seconds after the last heartbeat during which a node counts as healthy.
pub const HEALTH_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNode {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_node_type")]
    pub node_type: NodeType,
    #[serde(default = "default_capacity")]
    pub capacity: i64,
    #[serde(default)]
    pub api_version: Option<String>,
}

fn default_port() -> i64 {
    8000
}

fn default_node_type() -> NodeType {
    NodeType::Scanner
}

fn default_capacity() -> i64 {
    5
}

#[derive(Debug, Clone)]
pub enum Registration {
    Created(Node),
    Existing(Node),
}

impl Registration {
    pub fn node(&self) -> &Node {
        match self {
            Registration::Created(node) | Registration::Existing(node) => node,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Heartbeat {
    /// Status the node believes it has; informational only.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub current_tasks: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub id: i64,
    pub name: String,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_tasks: i64,
    pub capacity: i64,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AverageGauges {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodesByType {
    pub scanner: usize,
    pub worker: usize,
    pub coordinator: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetStatistics {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub maintenance_nodes: usize,
    pub total_capacity: i64,
    pub current_tasks: i64,
    pub available_capacity: i64,
    pub capacity_usage_percent: f64,
    pub average_metrics: AverageGauges,
    pub nodes_by_type: NodesByType,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub nodes_offline: Vec<i64>,
    pub requeued_tasks: Vec<i64>,
}

fn is_healthy(node: &Node, now: DateTime<Utc>) -> bool {
    node.status == NodeStatus::Online
        && node
            .last_heartbeat
            .is_some_and(|at| now - at <= Duration::seconds(HEALTH_WINDOW_SECS))
}

fn clamp_gauge(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

#[derive(Clone)]
pub struct FleetManager {
    pool: SqlitePool,
}

impl FleetManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent by name: a second registration returns the stored node.
    pub async fn register(&self, req: RegisterNode) -> Result<Registration> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ScanError::validation("node name is required"));
        }
        if req.host.trim().is_empty() {
            return Err(ScanError::validation("node host is required"));
        }
        if !(1..=65535).contains(&req.port) {
            return Err(ScanError::validation("node port must be within 1..=65535"));
        }
        if !(1..=1000).contains(&req.capacity) {
            return Err(ScanError::validation("node capacity must be within 1..=1000"));
        }

        let (node, created) = nodes::insert_if_absent(
            &self.pool,
            &NewNode {
                name: name.to_string(),
                host: req.host.trim().to_string(),
                port: req.port,
                node_type: req.node_type,
                capacity: req.capacity,
                api_version: req.api_version,
            },
        )
        .await?;

        if created {
            info!(node_id = node.id, name = %node.name, host = %node.host, "node registered");
            Ok(Registration::Created(node))
        } else {
            debug!(node_id = node.id, name = %node.name, "node already registered");
            Ok(Registration::Existing(node))
        }
    }

    pub async fn heartbeat(&self, node_id: i64, beat: Heartbeat) -> Result<Node> {
        let gauges = ResourceGauges {
            cpu_usage: clamp_gauge(beat.cpu_usage),
            memory_usage: clamp_gauge(beat.memory_usage),
            disk_usage: clamp_gauge(beat.disk_usage),
        };
        if !nodes::record_heartbeat(&self.pool, node_id, gauges, Utc::now()).await? {
            return Err(ScanError::NotFound(format!("node {node_id}")));
        }
        let node = self.get(node_id).await?;
        if let Some(reported) = beat.current_tasks {
            if reported != node.current_tasks {
                warn!(
                    node_id,
                    reported,
                    tracked = node.current_tasks,
                    "node reports a different task count"
                );
            }
        }
        Ok(node)
    }

    pub async fn get(&self, node_id: i64) -> Result<Node> {
        nodes::get_node(&self.pool, node_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("node {node_id}")))
    }

    pub async fn list(&self) -> Result<Vec<Node>> {
        nodes::list_nodes(&self.pool).await
    }

    pub async fn health(&self, node_id: i64) -> Result<NodeHealth> {
        let node = self.get(node_id).await?;
        Ok(NodeHealth {
            is_healthy: is_healthy(&node, Utc::now()),
            id: node.id,
            name: node.name,
            status: node.status,
            last_heartbeat: node.last_heartbeat,
            current_tasks: node.current_tasks,
            capacity: node.capacity,
        })
    }

    /// Healthy nodes of the type the task needs that still have a free slot,
    /// least loaded first.
    async fn candidates(&self, task_type: TaskType) -> Result<Vec<Node>> {
        let now = Utc::now();
        Ok(nodes::online_of_type(&self.pool, task_type.node_type())
            .await?
            .into_iter()
            .filter(|n| is_healthy(n, now) && n.current_tasks < n.capacity)
            .collect())
    }

    /// `None` means every suitable node is busy or stale; try again later.
    pub async fn select_node(&self, task_type: TaskType) -> Result<Option<Node>> {
        Ok(self.candidates(task_type).await?.into_iter().next())
    }

    pub async fn reserve(&self, node_id: i64) -> Result<bool> {
        nodes::try_reserve(&self.pool, node_id).await
    }

    pub async fn release(&self, node_id: i64) -> Result<()> {
        nodes::release(&self.pool, node_id).await?;
        Ok(())
    }

    /// Selects and reserves in one step, falling through to the next
    /// candidate when another caller took the last slot first.
    pub async fn acquire(&self, task_type: TaskType) -> Result<Option<Node>> {
        for node in self.candidates(task_type).await? {
            if self.reserve(node.id).await? {
                debug!(node_id = node.id, %task_type, "node slot reserved");
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Enabling puts the node into maintenance; disabling returns it to
    /// offline until its next heartbeat.
    pub async fn set_maintenance(&self, node_id: i64, enabled: bool) -> Result<Node> {
        let status = if enabled {
            NodeStatus::Maintenance
        } else {
            NodeStatus::Offline
        };
        if !nodes::set_status(&self.pool, node_id, status).await? {
            return Err(ScanError::NotFound(format!("node {node_id}")));
        }
        info!(node_id, enabled, "node maintenance changed");
        self.get(node_id).await
    }

    pub async fn remove(&self, node_id: i64) -> Result<()> {
        let node = self.get(node_id).await?;
        if !nodes::delete_if_idle(&self.pool, node_id).await? {
            return Err(ScanError::validation(format!(
                "node {} still has {} running tasks",
                node.name, node.current_tasks
            )));
        }
        info!(node_id, name = %node.name, "node removed");
        Ok(())
    }

    pub async fn statistics(&self) -> Result<FleetStatistics> {
        let all = self.list().await?;
        if all.is_empty() {
            return Ok(FleetStatistics::default());
        }

        let count = |status: NodeStatus| all.iter().filter(|n| n.status == status).count();
        let count_type = |t: NodeType| all.iter().filter(|n| n.node_type == t).count();
        let total_capacity: i64 = all.iter().map(|n| n.capacity).sum();
        let current_tasks: i64 = all.iter().map(|n| n.current_tasks).sum();
        let n = all.len() as f64;
        let avg = |f: fn(&Node) -> f64| (all.iter().map(f).sum::<f64>() / n * 100.0).round() / 100.0;

        Ok(FleetStatistics {
            total_nodes: all.len(),
            online_nodes: count(NodeStatus::Online),
            offline_nodes: count(NodeStatus::Offline),
            maintenance_nodes: count(NodeStatus::Maintenance),
            total_capacity,
            current_tasks,
            available_capacity: total_capacity - current_tasks,
            capacity_usage_percent: if total_capacity > 0 {
                current_tasks as f64 / total_capacity as f64 * 100.0
            } else {
                0.0
            },
            average_metrics: AverageGauges {
                cpu_usage: avg(|n| n.cpu_usage),
                memory_usage: avg(|n| n.memory_usage),
                disk_usage: avg(|n| n.disk_usage),
            },
            nodes_by_type: NodesByType {
                scanner: count_type(NodeType::Scanner),
                worker: count_type(NodeType::Worker),
                coordinator: count_type(NodeType::Coordinator),
            },
        })
    }

    /// Flips online nodes without a recent heartbeat to offline and hands
    /// their running tasks back to PENDING. The caller restarts them.
    pub async fn sweep_offline(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - Duration::seconds(HEALTH_WINDOW_SECS);
        let mut report = SweepReport::default();

        for node in nodes::stale_online(&self.pool, cutoff).await? {
            let mut tx = self.pool.begin().await?;
            if !nodes::mark_offline_if_stale(&mut *tx, node.id, cutoff).await? {
                // heartbeat arrived in between
                continue;
            }
            let orphaned = tasks::running_on_node(&mut *tx, node.id).await?;
            let mut requeued = Vec::with_capacity(orphaned.len());
            for task_id in orphaned {
                if tasks::requeue(&mut *tx, task_id).await? {
                    tasks::append_log(
                        &mut *tx,
                        task_id,
                        LogLevel::Warning,
                        &format!("Node {} went offline; task returned to pending", node.name),
                    )
                    .await?;
                    requeued.push(task_id);
                }
            }
            tx.commit().await?;

            warn!(
                node_id = node.id,
                name = %node.name,
                requeued = requeued.len(),
                "node marked offline"
            );
            report.nodes_offline.push(node.id);
            report.requeued_tasks.extend(requeued);
        }

        Ok(report)
    }
}
