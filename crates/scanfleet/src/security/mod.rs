use std::{
    fmt,
    net::IpAddr,
    path::Path,
    process::Stdio,
    str::FromStr,
    time::Duration,
};

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::{process::Command, time::timeout};
use tracing::info;
use url::{Host, Url};

use crate::{
    error::{Result, ScanError},
    models::ToolOptions,
};

pub const MIN_TOOL_TIMEOUT_SECS: u64 = 60;
pub const MAX_TOOL_TIMEOUT_SECS: u64 = 600;

const MAX_OPTION_LEN: usize = 512;
const MAX_POC_BYTES: usize = 256 * 1024;

static DOMAIN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
        .expect("domain regex should compile")
});

static OPTION_VALUE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.,:/=*+\-]+$").expect("option regex should compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Address,
    Network,
    Domain,
    Url,
}

/// A scan target, parsed once at the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Address(IpAddr),
    Network(IpNet),
    Domain(String),
    Url(Url),
}

impl TargetSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ScanError::validation("target is empty"));
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw).map_err(|_| ScanError::validation("invalid target URL"))?;
            if url.host().is_none() {
                return Err(ScanError::validation("target URL has no host"));
            }
            return Ok(TargetSpec::Url(url));
        }

        if raw.contains('/') {
            return IpNet::from_str(raw)
                .map(TargetSpec::Network)
                .map_err(|_| ScanError::validation("invalid CIDR target"));
        }

        if let Ok(ip) = IpAddr::from_str(raw) {
            return Ok(TargetSpec::Address(ip));
        }

        let domain = raw.trim_end_matches('.').to_ascii_lowercase();
        if domain.len() <= 253 && DOMAIN_REGEX.is_match(&domain) {
            return Ok(TargetSpec::Domain(domain));
        }

        Err(ScanError::validation("invalid target"))
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            TargetSpec::Address(_) => TargetKind::Address,
            TargetSpec::Network(_) => TargetKind::Network,
            TargetSpec::Domain(_) => TargetKind::Domain,
            TargetSpec::Url(_) => TargetKind::Url,
        }
    }

    /// Host part of the target; for a network this is the network itself.
    pub fn host(&self) -> String {
        match self {
            TargetSpec::Address(ip) => ip.to_string(),
            TargetSpec::Network(net) => net.to_string(),
            TargetSpec::Domain(name) => name.clone(),
            TargetSpec::Url(url) => url_host(url).unwrap_or_default(),
        }
    }

    /// Whether an asset address lies inside this target.
    pub fn contains(&self, address: &str) -> bool {
        let ip = IpAddr::from_str(address).ok();
        match (self, ip) {
            (TargetSpec::Address(target), Some(ip)) => *target == ip,
            (TargetSpec::Network(net), Some(ip)) => net.contains(&ip),
            (TargetSpec::Network(_), None) => false,
            _ => self.host().eq_ignore_ascii_case(address),
        }
    }

    /// The same target, as an http URL when it is not one already.
    pub fn as_url(&self) -> Option<String> {
        match self {
            TargetSpec::Url(url) => Some(url.to_string()),
            TargetSpec::Address(IpAddr::V6(ip)) => Some(format!("http://[{ip}]/")),
            TargetSpec::Address(ip) => Some(format!("http://{ip}/")),
            TargetSpec::Domain(name) => Some(format!("http://{name}/")),
            TargetSpec::Network(_) => None,
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Address(ip) => write!(f, "{ip}"),
            TargetSpec::Network(net) => write!(f, "{net}"),
            TargetSpec::Domain(name) => f.write_str(name),
            TargetSpec::Url(url) => f.write_str(url.as_str()),
        }
    }
}

fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(d) => Some(d.to_ascii_lowercase()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

/// Reduces a matched location such as `https://a.b:8443/x` to its host `a.b`.
pub fn extract_host(matched: &str) -> Option<String> {
    let matched = matched.trim();
    if matched.is_empty() {
        return None;
    }
    if matched.contains("://") {
        if let Ok(url) = Url::parse(matched) {
            return url_host(&url);
        }
    }
    let without_path = matched.split('/').next().unwrap_or(matched);
    if let Ok(ip) = IpAddr::from_str(without_path.trim_start_matches('[').trim_end_matches(']')) {
        return Some(ip.to_string());
    }
    let host = match without_path.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => without_path,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Allow-list entries are exact host names or networks. A network target is
/// in scope only when an allowed network contains all of it.
pub fn in_scope(target: &TargetSpec, allowlist: &[String]) -> bool {
    let host = target.host();
    if let TargetSpec::Domain(_) | TargetSpec::Url(_) = target {
        if allowlist
            .iter()
            .any(|item| item.trim().eq_ignore_ascii_case(&host))
        {
            return true;
        }
    }

    let allowed_nets = || {
        allowlist.iter().filter_map(|entry| {
            let entry = entry.trim();
            IpNet::from_str(entry)
                .ok()
                .or_else(|| IpAddr::from_str(entry).ok().map(IpNet::from))
        })
    };

    match target {
        TargetSpec::Network(net) => allowed_nets().any(|allowed| allowed.contains(net)),
        _ => match IpAddr::from_str(&host) {
            Ok(ip) => allowed_nets().any(|allowed| allowed.contains(&ip)),
            Err(_) => false,
        },
    }
}

fn check_token(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_OPTION_LEN {
        return Err(ScanError::validation(format!("option {field} has invalid length")));
    }
    if value.starts_with('-') || !OPTION_VALUE_REGEX.is_match(value) {
        return Err(ScanError::validation(format!("option {field} contains illegal characters")));
    }
    Ok(())
}

/// Rejects option values that could be mistaken for flags or carry shell syntax.
pub fn validate_options(options: &ToolOptions) -> Result<()> {
    let tokens = [
        ("ports", &options.ports),
        ("severity", &options.severity),
        ("templates", &options.templates),
        ("wordlist", &options.wordlist),
        ("extensions", &options.extensions),
    ];
    for (field, value) in tokens {
        if let Some(value) = value {
            check_token(field, value)?;
        }
    }
    if let Some(threads) = options.threads {
        if !(1..=1000).contains(&threads) {
            return Err(ScanError::validation("option threads must be within 1..=1000"));
        }
    }
    if let Some(secs) = options.timeout {
        if !(1..=3600).contains(&secs) {
            return Err(ScanError::validation("option timeout must be within 1..=3600"));
        }
    }
    if let Some(poc) = &options.poc {
        if poc.trim().is_empty() || poc.len() > MAX_POC_BYTES {
            return Err(ScanError::validation("option poc has invalid length"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs an allow-listed tool with discrete argument tokens. The child is
/// killed when the timeout fires or the returned future is dropped.
pub async fn run_command_allowlisted(
    tool: &str,
    program: &Path,
    args: &[String],
    allowed: &[String],
    timeout_secs: u64,
) -> Result<ProcessOutput> {
    if !allowed.iter().any(|name| name == tool) {
        return Err(ScanError::validation(format!("tool not allowed: {tool}")));
    }

    info!(tool, program = %program.display(), ?args, "audit: launching external tool");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ScanError::ToolFailed {
            tool: tool.to_string(),
            reason: format!("spawn failed: {e}"),
        })?;

    let out = match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(res) => res.map_err(|e| ScanError::ToolFailed {
            tool: tool.to_string(),
            reason: e.to_string(),
        })?,
        Err(_) => {
            return Err(ScanError::ToolTimeout {
                tool: tool.to_string(),
                secs: timeout_secs,
            })
        }
    };

    Ok(ProcessOutput {
        exit_code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_each_target_kind() {
        assert_eq!(TargetSpec::parse("10.0.0.5").unwrap().kind(), TargetKind::Address);
        assert_eq!(TargetSpec::parse("192.168.1.0/30").unwrap().kind(), TargetKind::Network);
        assert_eq!(TargetSpec::parse("Example.COM").unwrap(), TargetSpec::Domain("example.com".into()));
        assert_eq!(
            TargetSpec::parse("https://a.example.com:8443/login").unwrap().host(),
            "a.example.com"
        );
    }

    #[test]
    fn rejects_flag_and_shell_shaped_targets() {
        for raw in ["", "-oN /tmp/x", "10.0.0.1; rm -rf /", "a b", "10.0.0.0/99", "$(id)"] {
            assert!(TargetSpec::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn network_contains_addresses() {
        let target = TargetSpec::parse("192.168.1.0/30").unwrap();
        assert!(target.contains("192.168.1.1"));
        assert!(!target.contains("192.168.1.9"));
        assert!(!target.contains("example.com"));
    }

    #[test]
    fn scope_checks_networks_and_names() {
        let list = allow(&["10.0.0.0/8", "scanme.example.org"]);
        assert!(in_scope(&TargetSpec::parse("10.1.2.3").unwrap(), &list));
        assert!(in_scope(&TargetSpec::parse("10.1.0.0/16").unwrap(), &list));
        assert!(!in_scope(&TargetSpec::parse("0.0.0.0/0").unwrap(), &list));
        assert!(in_scope(&TargetSpec::parse("https://scanme.example.org/").unwrap(), &list));
        assert!(!in_scope(&TargetSpec::parse("other.example.org").unwrap(), &list));
        assert!(!in_scope(&TargetSpec::parse("10.0.0.1").unwrap(), &[]));
    }

    #[test]
    fn extract_host_strips_scheme_port_and_path() {
        assert_eq!(extract_host("https://a.b:8443/x").as_deref(), Some("a.b"));
        assert_eq!(extract_host("10.0.0.5:8080").as_deref(), Some("10.0.0.5"));
        assert_eq!(extract_host("10.0.0.5").as_deref(), Some("10.0.0.5"));
        assert_eq!(extract_host("http://[::1]:80/").as_deref(), Some("::1"));
        assert_eq!(extract_host(""), None);
    }

    #[test]
    fn option_values_cannot_look_like_flags() {
        let mut options = ToolOptions {
            ports: Some("22,80,1000-2000".into()),
            ..Default::default()
        };
        assert!(validate_options(&options).is_ok());

        options.ports = Some("-p- --script=evil".into());
        assert!(validate_options(&options).is_err());

        options.ports = None;
        options.templates = Some("cves/;id".into());
        assert!(validate_options(&options).is_err());

        options.templates = None;
        options.threads = Some(0);
        assert!(validate_options(&options).is_err());
    }

    #[tokio::test]
    async fn tools_outside_the_allowlist_are_not_spawned() {
        let err = run_command_allowlisted("sh", Path::new("sh"), &[], &allow(&["nmap"]), 60)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));
    }
}
