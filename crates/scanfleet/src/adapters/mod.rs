//! One adapter per external scanning tool, looked up by name.

mod afrog;
mod command;
mod dddd;
mod dirsearch;
mod fscan;
mod nmap;
mod nuclei;

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tracing::info;

pub use afrog::Afrog;
pub use command::{CommandAdapter, CommandTool, Invocation};
pub use dddd::Dddd;
pub use dirsearch::Dirsearch;
pub use fscan::Fscan;
pub use nmap::Nmap;
pub use nuclei::Nuclei;

use crate::{
    config::AppConfig,
    error::{Result, ScanError},
    models::{ParsedRecord, ToolOptions},
    security::{in_scope, validate_options, TargetKind, TargetSpec},
};

pub const MAX_RAW_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    PortScan,
    VulnScan,
    DirEnum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Warning,
    Error,
}

/// Result of one tool invocation. Expected failures (absent binary, timeout,
/// bad exit) are reported here with a `reason` instead of as errors.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub tool: String,
    pub target: String,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub raw: String,
    pub parsed: Vec<ParsedRecord>,
}

impl Outcome {
    pub fn error(tool: &str, target: &TargetSpec, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            target: target.to_string(),
            status: OutcomeStatus::Error,
            reason: Some(reason.into()),
            exit_code: None,
            raw: String::new(),
            parsed: Vec::new(),
        }
    }

    pub fn produced_findings(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success | OutcomeStatus::Warning)
    }
}

pub(crate) fn truncate_raw(mut raw: String) -> String {
    if raw.len() > MAX_RAW_BYTES {
        let mut cut = MAX_RAW_BYTES;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw.truncate(cut);
    }
    raw
}

#[async_trait::async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn family(&self) -> ToolFamily;
    fn accepts(&self, kind: TargetKind) -> bool;
    /// Binary that will be launched, as configured.
    fn binary(&self) -> &str;
    fn installed(&self) -> bool;
    async fn execute(&self, target: &TargetSpec, options: &ToolOptions) -> Outcome;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub family: ToolFamily,
    pub binary: String,
    pub installed: bool,
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<&'static str, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    /// Registers the enabled tools only; everything else is unknown.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let allowed: Arc<[String]> = cfg.enabled_tools.clone().into();
        let mut registry = Self::default();
        for name in &cfg.enabled_tools {
            let binary = cfg.tool_binary(name);
            let timeout = cfg.tool_timeout_secs(name);
            let allowed = allowed.clone();
            let adapter: Arc<dyn ToolAdapter> = match name.as_str() {
                "nmap" => Arc::new(CommandAdapter::new(Nmap, binary, timeout, allowed)),
                "fscan" => Arc::new(CommandAdapter::new(Fscan, binary, timeout, allowed)),
                "nuclei" => Arc::new(CommandAdapter::new(Nuclei, binary, timeout, allowed)),
                "afrog" => Arc::new(CommandAdapter::new(Afrog, binary, timeout, allowed)),
                "dddd" => Arc::new(CommandAdapter::new(Dddd, binary, timeout, allowed)),
                "dirsearch" => Arc::new(CommandAdapter::new(Dirsearch, binary, timeout, allowed)),
                _ => continue,
            };
            registry.register(adapter);
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| ScanError::validation(format!("unknown tool: {name}")))
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.adapters
            .values()
            .map(|a| ToolInfo {
                name: a.name(),
                family: a.family(),
                binary: a.binary().to_string(),
                installed: a.installed(),
            })
            .collect()
    }

    /// Ad-hoc invocation outside the pipeline. Unknown tools, malformed or
    /// out-of-scope targets and bad options are rejected before anything runs.
    pub async fn execute(
        &self,
        tool: &str,
        target: &str,
        options: &ToolOptions,
        scope_allowlist: &[String],
    ) -> Result<Outcome> {
        let adapter = self.get(tool)?;
        let target = TargetSpec::parse(target)?;
        if !adapter.accepts(target.kind()) {
            return Err(ScanError::validation(format!(
                "{tool} does not accept this kind of target"
            )));
        }
        if !in_scope(&target, scope_allowlist) {
            return Err(ScanError::validation("target out of scope"));
        }
        validate_options(options)?;

        info!(tool, target = %target, "executing tool");
        Ok(adapter.execute(&target, options).await)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_only_enabled_tools() {
        let cfg = AppConfig {
            enabled_tools: vec!["nmap".into(), "nuclei".into()],
            ..AppConfig::default()
        };
        let registry = AdapterRegistry::from_config(&cfg);
        let names: Vec<_> = registry.list_tools().iter().map(|t| t.name).collect();
        assert_eq!(names, ["nmap", "nuclei"]);
        assert!(matches!(registry.get("fscan"), Err(ScanError::Validation(_))));
    }

    #[tokio::test]
    async fn execute_rejects_before_running() {
        let registry = AdapterRegistry::from_config(&AppConfig::default());
        let scope = vec!["10.0.0.0/8".to_string()];
        let options = ToolOptions::default();

        let err = registry
            .execute("masscan", "10.0.0.1", &options, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));

        let err = registry
            .execute("nmap", "10.0.0.1;id", &options, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));

        let err = registry
            .execute("nmap", "192.168.0.1", &options, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));

        let err = registry
            .execute("dirsearch", "10.0.0.0/24", &options, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));
    }

    #[tokio::test]
    async fn absent_binary_is_an_error_outcome() {
        let mut cfg = AppConfig::default();
        cfg.tools.insert(
            "nmap".into(),
            crate::config::ToolConfig {
                binary: Some("scanfleet-test-no-such-nmap".into()),
                timeout_secs: 60,
            },
        );
        let registry = AdapterRegistry::from_config(&cfg);
        let outcome = registry
            .execute("nmap", "127.0.0.1", &ToolOptions::default(), &cfg.scope_allowlist)
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.reason.as_deref(), Some("nmap not installed"));
        assert!(outcome.exit_code.is_none());
        let nmap = registry
            .list_tools()
            .into_iter()
            .find(|t| t.name == "nmap")
            .unwrap();
        assert!(!nmap.installed);
        assert_eq!(nmap.binary, "scanfleet-test-no-such-nmap");
    }

    #[test]
    fn raw_output_is_capped() {
        let raw = "é".repeat(MAX_RAW_BYTES);
        let capped = truncate_raw(raw);
        assert!(capped.len() <= MAX_RAW_BYTES);
        assert!(capped.chars().all(|c| c == 'é'));
    }
}
