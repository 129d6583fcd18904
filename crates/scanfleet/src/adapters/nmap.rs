use std::path::Path;

use super::{CommandTool, Invocation, ToolFamily};
use crate::{
    models::{ParsedRecord, ToolOptions},
    parser::{parse_nmap_xml, ParseError},
    security::{TargetKind, TargetSpec},
};

pub struct Nmap;

impl CommandTool for Nmap {
    const NAME: &'static str = "nmap";
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
        inv.arg("-oX").arg("-").arg("--open");
        if options.service_detection {
            inv.arg("-sV");
        }
        if options.os_detection {
            inv.arg("-O");
        }
        inv.opt("-p", options.ports.as_deref())
            .opt("--min-parallelism", options.threads)
            .opt("--host-timeout", options.timeout.map(|t| format!("{t}s")))
            .arg(target.to_string());
        Ok(inv)
    }

    fn parse(&self, output: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        parse_nmap_xml(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_value_is_its_own_token() {
        let options = ToolOptions {
            ports: Some("22,80".into()),
            service_detection: true,
            timeout: Some(30),
            ..Default::default()
        };
        let target = TargetSpec::parse("192.168.1.0/30").unwrap();
        let inv = Nmap.invocation(&target, &options, Path::new("/tmp")).unwrap();
        assert_eq!(
            inv.args,
            ["-oX", "-", "--open", "-sV", "-p", "22,80", "--host-timeout", "30s", "192.168.1.0/30"]
        );
        assert!(inv.report.is_none());
    }
}
