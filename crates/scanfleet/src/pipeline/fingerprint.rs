//! Matches identified product/version pairs against a built-in rule table and
//! records one vulnerability per matched CVE.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use super::identify::match_banner;
use crate::{
    db::{
        inventory::{self, NewVulnerability, ServiceWithAddress},
        results,
    },
    error::Result,
    models::{Service, Severity},
};

pub const TOOL_NAME: &str = "fingerprint";

pub struct FingerprintRule {
    pub family: &'static str,
    product: Regex,
    version: Regex,
    pub cves: &'static [&'static str],
    pub severity: Severity,
}

impl FingerprintRule {
    pub fn matches(&self, product: &str, version: &str) -> bool {
        self.product.is_match(product) && self.version.is_match(version)
    }
}

fn rule(
    family: &'static str,
    product: &str,
    version: &str,
    cves: &'static [&'static str],
    severity: Severity,
) -> FingerprintRule {
    FingerprintRule {
        family,
        product: Regex::new(product).expect("product pattern"),
        version: Regex::new(version).expect("version pattern"),
        cves,
        severity,
    }
}

pub static RULES: Lazy<Vec<FingerprintRule>> = Lazy::new(|| {
    vec![
        rule(
            "Apache",
            r"(?i)^apache(?: httpd)?$",
            r"^2\.[024](?:\D|$)",
            &["CVE-2018-1312", "CVE-2019-10082"],
            Severity::High,
        ),
        rule(
            "Apache",
            r"(?i)^apache(?: httpd)?$",
            r"^2\.0(?:\D|$)",
            &["CVE-2005-3352"],
            Severity::Critical,
        ),
        rule(
            "OpenSSH",
            r"(?i)^openssh",
            r"^7\.[0-5](?:\D|$)",
            &["CVE-2018-15473"],
            Severity::Medium,
        ),
        rule("OpenSSH", r"(?i)^openssh", r"^6\.", &["CVE-2015-3646"], Severity::High),
        rule(
            "nginx",
            r"(?i)^nginx",
            r"^1\.1[0-5](?:\D|$)",
            &["CVE-2016-4897"],
            Severity::Medium,
        ),
        rule("MySQL", r"(?i)^mysql", r"^5\.[0-5](?:\D|$)", &["CVE-2019-2627"], Severity::High),
        rule(
            "PostgreSQL",
            r"(?i)^postgresql",
            r"^9\.[0-6](?:\D|$)",
            &["CVE-2017-7546"],
            Severity::Medium,
        ),
        rule("Redis", r"(?i)^redis", r"^[0-3]\.", &["CVE-2016-8339"], Severity::Critical),
        rule("Tomcat", r"(?i)tomcat", r"^7\.", &["CVE-2019-0232"], Severity::Critical),
        rule(
            "IIS",
            r"(?i)\biis\b",
            r"^7\.[0-5](?:\D|$)",
            &["CVE-2012-1077"],
            Severity::High,
        ),
    ]
});

/// Product and version for matching: stored fields first, banner second.
pub fn product_version(service: &Service) -> Option<(String, String)> {
    let banner = service.banner.as_deref().and_then(match_banner);
    let product = service
        .product
        .clone()
        .filter(|p| !p.trim().is_empty())
        .or_else(|| banner.as_ref().map(|b| b.product.to_string()))?;
    let version = service
        .version
        .clone()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| banner.and_then(|b| b.version))?;
    Some((product, version))
}

#[derive(Debug, Clone, Serialize)]
pub struct FingerprintMatch {
    pub service_id: i64,
    pub address: String,
    pub port: i64,
    pub family: &'static str,
    pub product: String,
    pub version: String,
    pub cve_id: &'static str,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FingerprintReport {
    pub examined: usize,
    pub matches: Vec<FingerprintMatch>,
}

pub fn match_service(entry: &ServiceWithAddress) -> Vec<FingerprintMatch> {
    let Some((product, version)) = product_version(&entry.service) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for rule in RULES.iter().filter(|r| r.matches(&product, &version)) {
        for cve in rule.cves {
            found.push(FingerprintMatch {
                service_id: entry.service.id,
                address: entry.address.clone(),
                port: entry.service.port,
                family: rule.family,
                product: product.clone(),
                version: version.clone(),
                cve_id: *cve,
                severity: rule.severity,
            });
        }
    }
    found
}

pub async fn run(
    pool: &SqlitePool,
    task_id: i64,
    services: &[ServiceWithAddress],
) -> Result<FingerprintReport> {
    let mut report = FingerprintReport {
        examined: services.len(),
        ..Default::default()
    };

    let mut tx = pool.begin().await?;
    for entry in services {
        for found in match_service(entry) {
            let title = format!("{} {} ({})", found.product, found.version, found.cve_id);
            let description = format!(
                "Fingerprint match on {}:{}/{}\nProduct: {} {}",
                found.address,
                found.port,
                entry.service.protocol,
                found.product,
                found.version
            );
            inventory::insert_vulnerability(
                &mut *tx,
                &NewVulnerability {
                    asset_id: entry.service.asset_id,
                    task_id: Some(task_id),
                    title: &title,
                    description: Some(&description),
                    severity: found.severity,
                    cve_id: Some(found.cve_id),
                    source_tool: Some(TOOL_NAME),
                },
            )
            .await?;
            report.matches.push(found);
        }
    }

    let data = serde_json::to_value(&report).unwrap_or_default();
    results::insert_task_result(&mut *tx, task_id, TOOL_NAME, TOOL_NAME, &data).await?;
    tx.commit().await?;

    debug!(task_id, matches = report.matches.len(), "fingerprints matched");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::ServiceState;

    fn entry(product: Option<&str>, version: Option<&str>, banner: Option<&str>) -> ServiceWithAddress {
        ServiceWithAddress {
            service: Service {
                id: 9,
                asset_id: 1,
                task_id: None,
                port: 22,
                protocol: "tcp".into(),
                state: ServiceState::Open,
                service_name: None,
                product: product.map(str::to_string),
                version: version.map(str::to_string),
                banner: banner.map(str::to_string),
                discovered_at: Utc::now(),
            },
            address: "10.0.0.5".into(),
        }
    }

    #[test]
    fn old_openssh_matches_user_enumeration() {
        let found = match_service(&entry(Some("OpenSSH"), Some("7.4"), None));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cve_id, "CVE-2018-15473");
        assert_eq!(found[0].severity, Severity::Medium);
    }

    #[test]
    fn one_match_per_cve() {
        let found = match_service(&entry(Some("Apache httpd"), Some("2.4.49"), None));
        let cves: Vec<_> = found.iter().map(|m| m.cve_id).collect();
        assert_eq!(cves, ["CVE-2018-1312", "CVE-2019-10082"]);
    }

    #[test]
    fn banner_fills_in_for_missing_fields() {
        let found = match_service(&entry(None, None, Some("SSH-2.0-OpenSSH_6.6.1p1 Ubuntu")));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cve_id, "CVE-2015-3646");
    }

    #[test]
    fn recent_versions_and_unknown_products_do_not_match() {
        assert!(match_service(&entry(Some("OpenSSH"), Some("9.3"), None)).is_empty());
        assert!(match_service(&entry(Some("nginx"), Some("1.9.0"), None)).is_empty());
        assert!(match_service(&entry(Some("Apache Tomcat"), Some("2.4.1"), None)).is_empty());
        assert!(match_service(&entry(Some("lighttpd"), Some("1.4"), None)).is_empty());
        assert!(match_service(&entry(Some("OpenSSH"), None, None)).is_empty());
    }
}
