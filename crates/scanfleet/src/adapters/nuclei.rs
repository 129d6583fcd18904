use std::path::Path;

use super::{CommandTool, Invocation, ToolFamily};
use crate::{
    models::{ParsedRecord, ToolOptions},
    parser::{parse_nuclei_jsonl, ParseError},
    security::{TargetKind, TargetSpec},
};

pub struct Nuclei;

impl CommandTool for Nuclei {
    const NAME: &'static str = "nuclei";
    const FAMILY: ToolFamily = ToolFamily::VulnScan;

    fn accepts(&self, _kind: TargetKind) -> bool {
        true
    }

    fn invocation(
        &self,
        target: &TargetSpec,
        options: &ToolOptions,
        workdir: &Path,
    ) -> std::io::Result<Invocation> {
        let mut inv = Invocation::default();
        inv.arg("-target").arg(target.to_string());
        match &options.poc {
            Some(template) => {
                let path = workdir.join("template.yaml");
                std::fs::write(&path, template)?;
                inv.arg("-t").arg(path.to_string_lossy());
            }
            None => {
                inv.opt("-t", options.templates.as_deref());
            }
        }
        inv.opt("-severity", options.severity.as_deref())
            .opt("-c", options.threads)
            .opt("-timeout", options.timeout)
            .arg("-silent")
            .arg("-jsonl")
            .report_to("-o", workdir.join("nuclei.jsonl"));
        Ok(inv)
    }

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        Ok(parse_nuclei_jsonl(output))
    }
}
