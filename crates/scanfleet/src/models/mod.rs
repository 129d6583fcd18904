use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TaskType {
    PortScan,
    ServiceIdentify,
    Fingerprint,
    PocDetection,
    DirectoryScan,
    Full,
}

impl TaskType {
    /// Node type a worker must run on to execute this task type.
    pub fn node_type(self) -> NodeType {
        match self {
            TaskType::PocDetection => NodeType::Worker,
            _ => NodeType::Scanner,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::PortScan => "port_scan",
            TaskType::ServiceIdentify => "service_identify",
            TaskType::Fingerprint => "fingerprint",
            TaskType::PocDetection => "poc_detection",
            TaskType::DirectoryScan => "directory_scan",
            TaskType::Full => "full",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task tool options. Every value ends up as its own argument token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOptions {
    pub ports: Option<String>,
    pub threads: Option<u32>,
    pub timeout: Option<u32>,
    pub severity: Option<String>,
    pub templates: Option<String>,
    pub wordlist: Option<String>,
    pub extensions: Option<String>,
    /// Inline POC/template content, written to a temp file for the run.
    pub poc: Option<String>,
    pub service_detection: bool,
    pub os_detection: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub task_type: TaskType,
    pub target: String,
    pub status: TaskStatus,
    pub progress: i64,
    pub current_step: Option<String>,
    pub total_steps: i64,
    pub priority: i64,
    pub options: Json<ToolOptions>,
    pub assigned_node_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskResult {
    pub id: i64,
    pub task_id: i64,
    pub tool: String,
    pub result_type: String,
    pub result_data: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum NodeType {
    Scanner,
    Worker,
    Coordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i64,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub capacity: i64,
    pub current_tasks: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub api_version: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: i64,
    pub address: String,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum ServiceState {
    Open,
    Closed,
    Filtered,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub asset_id: i64,
    pub task_id: Option<i64>,
    pub port: i64,
    pub protocol: String,
    pub state: ServiceState,
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    /// Maps a tool's severity word onto the canonical scale. Unknown words are medium.
    pub fn from_tool(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("critical") => Severity::Critical,
            Some("high") => Severity::High,
            Some("medium") | Some("moderate") => Severity::Medium,
            Some("low") => Severity::Low,
            Some("info") | Some("informational") | Some("none") => Severity::Info,
            _ => Severity::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum VulnStatus {
    Open,
    Fixed,
    Verified,
    FalsePositive,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vulnerability {
    pub id: i64,
    pub asset_id: i64,
    pub task_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub status: VulnStatus,
    pub cve_id: Option<String>,
    pub source_tool: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VulnerabilityHistory {
    pub id: i64,
    pub vulnerability_id: i64,
    pub old_status: VulnStatus,
    pub new_status: VulnStatus,
    pub note: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// An open port as reported by a port scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub address: String,
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: String,
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub os: Option<String>,
}

/// A template/POC match reported by a vulnerability scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub matched_at: Option<String>,
    pub name: String,
    pub severity: Option<String>,
    pub cve_id: Option<String>,
    pub template_id: Option<String>,
    pub description: Option<String>,
}

/// A path discovered by a directory brute-forcer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRecord {
    pub url: Option<String>,
    pub path: String,
    pub status: Option<u16>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedRecord {
    OpenPort(PortRecord),
    Match(MatchRecord),
    Path(PathRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub items: Vec<T>,
}
