use std::path::Path;

use super::{CommandTool, Invocation, ToolFamily};
use crate::{
    models::{ParsedRecord, ToolOptions},
    parser::{parse_afrog_json, ParseError},
    security::{TargetKind, TargetSpec},
};

pub struct Afrog;

impl CommandTool for Afrog {
    const NAME: &'static str = "afrog";
    const FAMILY: ToolFamily = ToolFamily::VulnScan;

    fn accepts(&self, kind: TargetKind) -> bool {
        !matches!(kind, TargetKind::Network)
    }

    fn invocation(
        &self,
        target: &TargetSpec,
        options: &ToolOptions,
        workdir: &Path,
    ) -> std::io::Result<Invocation> {
        let mut inv = Invocation::default();
        inv.arg("-t").arg(target.to_string());
        if let Some(poc) = &options.poc {
            let path = workdir.join("poc.yaml");
            std::fs::write(&path, poc)?;
            inv.arg("-P").arg(path.to_string_lossy());
        }
        inv.opt("-timeout", options.timeout)
            .opt("-c", options.threads)
            .report_to("-json", workdir.join("afrog.json"));
        Ok(inv)
    }

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        parse_afrog_json(output)
    }
}
