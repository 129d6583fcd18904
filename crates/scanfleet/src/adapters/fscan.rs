use std::path::Path;

use super::{CommandTool, Invocation, ToolFamily};
use crate::{
    models::{ParsedRecord, ToolOptions},
    parser::{parse_fscan_jsonl, ParseError},
    security::{TargetKind, TargetSpec},
};

pub struct Fscan;

impl CommandTool for Fscan {
    const NAME: &'static str = "fscan";
    const FAMILY: ToolFamily = ToolFamily::PortScan;

    fn accepts(&self, kind: TargetKind) -> bool {
        !matches!(kind, TargetKind::Url)
    }

    fn invocation(
        &self,
        target: &TargetSpec,
        options: &ToolOptions,
        _workdir: &Path,
    ) -> std::io::Result<Invocation> {
        let mut inv = Invocation::default();
        inv.arg("-h")
            .arg(target.to_string())
            .opt("-p", options.ports.as_deref())
            .opt("-time", options.timeout)
            .opt("-t", options.threads)
            .arg("-nocolor")
            .arg("-json");
        Ok(inv)
    }

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        Ok(parse_fscan_jsonl(output))
    }
}
