use std::path::Path;

use super::{CommandTool, Invocation, ToolFamily};
use crate::{
    models::{ParsedRecord, ToolOptions},
    parser::{parse_dddd_json, ParseError},
    security::{TargetKind, TargetSpec},
};

pub struct Dddd;

impl CommandTool for Dddd {
    const NAME: &'static str = "dddd";
    const FAMILY: ToolFamily = ToolFamily::VulnScan;

    fn accepts(&self, _kind: TargetKind) -> bool {
        true
    }

    fn invocation(
        &self,
        target: &TargetSpec,
        options: &ToolOptions,
        _workdir: &Path,
    ) -> std::io::Result<Invocation> {
        let mut inv = Invocation::default();
        inv.arg("-t")
            .arg(target.to_string())
            .opt("-timeout", options.timeout)
            .arg("-of")
            .arg("json");
        Ok(inv)
    }

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        parse_dddd_json(output)
    }
}
