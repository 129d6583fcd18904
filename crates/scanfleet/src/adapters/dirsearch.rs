use std::path::Path;

use super::{CommandTool, Invocation, ToolFamily};
use crate::{
    models::{ParsedRecord, ToolOptions},
    parser::{parse_dirsearch_json, ParseError},
    security::{TargetKind, TargetSpec},
};

pub struct Dirsearch;

impl CommandTool for Dirsearch {
    const NAME: &'static str = "dirsearch";
    const FAMILY: ToolFamily = ToolFamily::DirEnum;

    /// Needs something that can be turned into a base URL.
    fn accepts(&self, kind: TargetKind) -> bool {
        !matches!(kind, TargetKind::Network)
    }

    fn invocation(
        &self,
        target: &TargetSpec,
        options: &ToolOptions,
        workdir: &Path,
    ) -> std::io::Result<Invocation> {
        let url = target.as_url().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "target has no URL form")
        })?;
        let mut inv = Invocation::default();
        inv.arg("-u")
            .arg(url)
            .opt("-w", options.wordlist.as_deref())
            .opt("-e", options.extensions.as_deref())
            .opt("-t", options.threads)
            .opt("--timeout", options.timeout)
            .arg("-q")
            .arg("--format")
            .arg("json")
            .report_to("-o", workdir.join("dirsearch.json"));
        Ok(inv)
    }

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        parse_dirsearch_json(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hosts_are_scanned_over_http() {
        let target = TargetSpec::parse("10.0.0.3").unwrap();
        let inv = Dirsearch
            .invocation(&target, &ToolOptions::default(), Path::new("/tmp/x"))
            .unwrap();
        assert_eq!(inv.args[..2], ["-u", "http://10.0.0.3/"]);
        assert_eq!(inv.report.as_deref(), Some(Path::new("/tmp/x/dirsearch.json")));
    }
}
