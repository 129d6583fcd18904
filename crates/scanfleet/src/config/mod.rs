use std::{collections::BTreeMap, env, fs};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::security::{MAX_TOOL_TIMEOUT_SECS, MIN_TOOL_TIMEOUT_SECS};

pub const KNOWN_TOOLS: [&str; 6] = ["nmap", "fscan", "nuclei", "afrog", "dddd", "dirsearch"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Binary name or path; defaults to the tool name.
    pub binary: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub port_scanner: String,
    pub poc_tools: Vec<String>,
    pub dir_tool: String,
    /// When false, a job that finds no free node runs on the local worker pool.
    pub require_node: bool,
    pub node_retry_secs: u64,
    pub cancel_poll_millis: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            port_scanner: "nmap".to_string(),
            poc_tools: vec!["nuclei".to_string()],
            dir_tool: "dirsearch".to_string(),
            require_node: true,
            node_retry_secs: 15,
            cancel_poll_millis: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Also record an info vulnerability for every open port.
    pub port_exposure_findings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub scope_allowlist: Vec<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub sweep_interval_secs: u64,
    pub task_rate_limit_per_minute: usize,
    pub tools: BTreeMap<String, ToolConfig>,
    pub enabled_tools: Vec<String>,
    pub pipeline: PipelineConfig,
    pub normalizer: NormalizerConfig,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANFLEET_CONFIG").unwrap_or_else(|_| "scanfleet.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();

        if let Ok(v) = env::var("SF_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = env::var("SF_PORT") {
            cfg.port = v.parse().unwrap_or(cfg.port);
        }
        if let Ok(v) = env::var("SF_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("SF_SCOPE_ALLOWLIST") {
            cfg.scope_allowlist = split_list(&v);
        }
        if let Ok(v) = env::var("SF_WORKERS") {
            cfg.workers = v.parse().unwrap_or(cfg.workers);
        }
        if let Ok(v) = env::var("SF_ENABLED_TOOLS") {
            cfg.enabled_tools = split_list(&v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if let Some(unknown) = self
            .enabled_tools
            .iter()
            .find(|t| !KNOWN_TOOLS.contains(&t.as_str()))
        {
            anyhow::bail!("unknown tool in enabled_tools: {unknown}");
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> ToolConfig {
        self.tools.get(name).cloned().unwrap_or_default()
    }

    pub fn tool_binary(&self, name: &str) -> String {
        self.tool(name).binary.unwrap_or_else(|| name.to_string())
    }

    /// Per-tool wall-clock limit, always within 60..=600 seconds.
    pub fn tool_timeout_secs(&self, name: &str) -> u64 {
        self.tool(name)
            .timeout_secs
            .clamp(MIN_TOOL_TIMEOUT_SECS, MAX_TOOL_TIMEOUT_SECS)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://scanfleet.db".to_string(),
            scope_allowlist: vec!["127.0.0.1/32".to_string(), "localhost".to_string()],
            workers: 4,
            queue_capacity: 128,
            sweep_interval_secs: 30,
            task_rate_limit_per_minute: 30,
            tools: BTreeMap::new(),
            enabled_tools: KNOWN_TOOLS.iter().map(|t| t.to_string()).collect(),
            pipeline: PipelineConfig::default(),
            normalizer: NormalizerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"port": 9000, "tools": {"nmap": {"timeout_secs": 5}, "nuclei": {"binary": "/opt/nuclei"}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.sweep_interval_secs, 30);
        assert_eq!(cfg.pipeline.port_scanner, "nmap");
        assert_eq!(cfg.enabled_tools.len(), KNOWN_TOOLS.len());
        assert_eq!(cfg.tool_timeout_secs("nmap"), 60);
        assert_eq!(cfg.tool_timeout_secs("fscan"), 300);
        assert_eq!(cfg.tool_binary("nuclei"), "/opt/nuclei");
        assert_eq!(cfg.tool_binary("afrog"), "afrog");
    }

    #[test]
    fn unknown_enabled_tool_is_rejected() {
        let cfg = AppConfig {
            enabled_tools: vec!["nmap".into(), "masscan".into()],
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
