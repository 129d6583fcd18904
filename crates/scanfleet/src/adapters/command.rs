use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use super::{truncate_raw, Outcome, OutcomeStatus, ToolAdapter, ToolFamily};
use crate::{
    error::ScanError,
    models::{ParsedRecord, ToolOptions},
    parser::ParseError,
    security::{run_command_allowlisted, validate_options, TargetKind, TargetSpec},
};

/// Argument vector for one run, plus the report file the tool writes when it
/// does not report on stdout.
#[derive(Debug, Default)]
pub struct Invocation {
    pub args: Vec<String>,
    pub report: Option<PathBuf>,
}

impl Invocation {
    pub fn arg(&mut self, value: impl Into<String>) -> &mut Self {
        self.args.push(value.into());
        self
    }

    pub fn opt(&mut self, flag: &str, value: Option<impl ToString>) -> &mut Self {
        if let Some(value) = value {
            self.args.push(flag.to_string());
            self.args.push(value.to_string());
        }
        self
    }

    pub fn report_to(&mut self, flag: &str, path: PathBuf) -> &mut Self {
        self.args.push(flag.to_string());
        self.args.push(path.to_string_lossy().into_owned());
        self.report = Some(path);
        self
    }
}

/// A tool driven through its command line.
pub trait CommandTool: Send + Sync + 'static {
    const NAME: &'static str;
    const FAMILY: ToolFamily;

    fn accepts(&self, kind: TargetKind) -> bool;

    /// Builds the arguments. Files the tool needs are created under `workdir`,
    /// which is removed once the run is over.
    fn invocation(
        &self,
        target: &TargetSpec,
        options: &ToolOptions,
        workdir: &Path,
    ) -> std::io::Result<Invocation>;

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError>;
}

pub struct CommandAdapter<T> {
    tool: T,
    binary: String,
    timeout_secs: u64,
    allowed: Arc<[String]>,
}

impl<T: CommandTool> CommandAdapter<T> {
    pub fn new(tool: T, binary: String, timeout_secs: u64, allowed: Arc<[String]>) -> Self {
        Self {
            tool,
            binary,
            timeout_secs,
            allowed,
        }
    }
}

#[async_trait::async_trait]
impl<T: CommandTool> ToolAdapter for CommandAdapter<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn family(&self) -> ToolFamily {
        T::FAMILY
    }

    fn accepts(&self, kind: TargetKind) -> bool {
        self.tool.accepts(kind)
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn installed(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    async fn execute(&self, target: &TargetSpec, options: &ToolOptions) -> Outcome {
        let name = T::NAME;
        if !self.tool.accepts(target.kind()) {
            return Outcome::error(name, target, "unsupported target kind");
        }
        if let Err(e) = validate_options(options) {
            return Outcome::error(name, target, e.to_string());
        }

        let program = match which::which(&self.binary) {
            Ok(path) => path,
            Err(_) => {
                warn!(tool = name, binary = %self.binary, "tool not installed");
                return Outcome::error(name, target, format!("{name} not installed"));
            }
        };

        let workdir = match tempfile::Builder::new().prefix("scanfleet-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return Outcome::error(name, target, format!("temp dir: {e}")),
        };
        let invocation = match self.tool.invocation(target, options, workdir.path()) {
            Ok(inv) => inv,
            Err(e) => return Outcome::error(name, target, format!("prepare run: {e}")),
        };

        let output = match run_command_allowlisted(
            name,
            &program,
            &invocation.args,
            &self.allowed,
            self.timeout_secs,
        )
        .await
        {
            Ok(output) => output,
            Err(ScanError::ToolTimeout { secs, .. }) => {
                warn!(tool = name, target = %target, secs, "tool timed out");
                return Outcome::error(name, target, format!("timed out after {secs}s"));
            }
            Err(e) => return Outcome::error(name, target, e.to_string()),
        };

        let body = match &invocation.report {
            Some(path) => tokio::fs::read_to_string(path).await.unwrap_or_default(),
            None => output.stdout.clone(),
        };
        let code = output
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());

        let detail = output.stderr.lines().next().unwrap_or_default().trim().to_string();
        let (status, reason, parsed) = match (output.success(), self.tool.parse(&body)) {
            // lenient parsers accept an empty report, a crashed run must not pass
            (false, _) if body.trim().is_empty() => (
                OutcomeStatus::Error,
                Some(format!("exited with code {code} and no output: {detail}")),
                Vec::new(),
            ),
            (true, Ok(parsed)) => (OutcomeStatus::Success, None, parsed),
            (false, Ok(parsed)) => (
                OutcomeStatus::Warning,
                Some(format!("exited with code {code}")),
                parsed,
            ),
            (true, Err(e)) => (
                OutcomeStatus::Warning,
                Some(format!("unparseable output: {e}")),
                Vec::new(),
            ),
            (false, Err(_)) => (
                OutcomeStatus::Error,
                Some(format!("exited with code {code}: {detail}")),
                Vec::new(),
            ),
        };
        debug!(tool = name, ?status, records = parsed.len(), "tool finished");

        let raw = if body.trim().is_empty() {
            output.stderr
        } else {
            body
        };
        drop(workdir);

        Outcome {
            tool: name.to_string(),
            target: target.to_string(),
            status,
            reason,
            exit_code: output.exit_code,
            raw: truncate_raw(raw),
            parsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::parser::parse_nmap_xml;

    /// Runs `sh -c <script>` and records the work dir it was given.
    struct ShellTool {
        script: &'static str,
        seen_workdir: Mutex<Option<PathBuf>>,
        /// Accepts any output, like the JSON-lines parsers do.
        lenient: bool,
    }

    impl ShellTool {
        fn new(script: &'static str) -> Self {
            Self {
                script,
                seen_workdir: Mutex::new(None),
                lenient: false,
            }
        }
    }

    impl CommandTool for ShellTool {
        const NAME: &'static str = "shell";
        const FAMILY: ToolFamily = ToolFamily::PortScan;

        fn accepts(&self, _kind: TargetKind) -> bool {
            true
        }

        fn invocation(
            &self,
            _target: &TargetSpec,
            _options: &ToolOptions,
            workdir: &Path,
        ) -> std::io::Result<Invocation> {
            std::fs::write(workdir.join("poc.yaml"), "id: test")?;
            *self.seen_workdir.lock().unwrap() = Some(workdir.to_path_buf());
            let mut inv = Invocation::default();
            inv.arg("-c").arg(self.script);
            Ok(inv)
        }

        fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
            if self.lenient {
                return Ok(Vec::new());
            }
            parse_nmap_xml(output)
        }
    }

    fn adapter(script: &'static str, timeout_secs: u64) -> CommandAdapter<ShellTool> {
        CommandAdapter::new(
            ShellTool::new(script),
            "sh".to_string(),
            timeout_secs,
            vec!["shell".to_string()].into(),
        )
    }

    fn target() -> TargetSpec {
        TargetSpec::parse("127.0.0.1").unwrap()
    }

    #[tokio::test]
    async fn clean_exit_is_success_and_workdir_is_removed() {
        let adapter = adapter("printf '<nmaprun></nmaprun>'", 5);
        let outcome = adapter.execute(&target(), &ToolOptions::default()).await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.raw, "<nmaprun></nmaprun>");

        let workdir = adapter.tool.seen_workdir.lock().unwrap().clone().unwrap();
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_with_parseable_output_is_a_warning() {
        let adapter = adapter("printf '<nmaprun></nmaprun>'; exit 3", 5);
        let outcome = adapter.execute(&target(), &ToolOptions::default()).await;
        assert_eq!(outcome.status, OutcomeStatus::Warning);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn non_zero_exit_without_output_is_an_error_even_for_lenient_parsers() {
        let adapter = CommandAdapter::new(
            ShellTool {
                lenient: true,
                ..ShellTool::new("echo 'templates missing' >&2; exit 2")
            },
            "sh".to_string(),
            5,
            vec!["shell".to_string()].into(),
        );
        let outcome = adapter.execute(&target(), &ToolOptions::default()).await;
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("exited with code 2 and no output: templates missing")
        );

        let clean = CommandAdapter::new(
            ShellTool {
                lenient: true,
                ..ShellTool::new("true")
            },
            "sh".to_string(),
            5,
            vec!["shell".to_string()].into(),
        );
        let outcome = clean.execute(&target(), &ToolOptions::default()).await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
    }

    #[tokio::test]
    async fn timeout_kills_the_run_and_cleans_up() {
        let adapter = adapter("sleep 5", 1);
        let outcome = adapter.execute(&target(), &ToolOptions::default()).await;
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.reason.as_deref(), Some("timed out after 1s"));

        let workdir = adapter.tool.seen_workdir.lock().unwrap().clone().unwrap();
        assert!(!workdir.exists());
    }
}
