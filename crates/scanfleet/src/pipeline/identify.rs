//! Service identification: names services from the well-known port table and
//! pulls product/version out of captured banners. Only missing fields are
//! filled; what the scanner reported wins.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::{
    db::{
        inventory::{self, ServiceWithAddress},
        results,
    },
    error::Result,
    models::Service,
};

pub const TOOL_NAME: &str = "service_identify";

const WELL_KNOWN_PORTS: &[(i64, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (80, "http"),
    (110, "pop3"),
    (143, "imap"),
    (443, "https"),
    (445, "smb"),
    (465, "smtps"),
    (587, "smtp"),
    (993, "imaps"),
    (995, "pop3s"),
    (1433, "mssql"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5432, "postgresql"),
    (5984, "couchdb"),
    (6379, "redis"),
    (8080, "http"),
    (8443, "https"),
    (9200, "elasticsearch"),
    (27017, "mongodb"),
];

pub fn well_known_service(port: i64) -> Option<&'static str> {
    WELL_KNOWN_PORTS
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, name)| *name)
}

struct BannerPattern {
    product: &'static str,
    service: &'static str,
    regex: Regex,
}

fn pattern(product: &'static str, service: &'static str, regex: &str) -> BannerPattern {
    BannerPattern {
        product,
        service,
        regex: Regex::new(regex).expect("banner pattern"),
    }
}

// Tomcat before Apache: both answer with an "Apache" token.
static BANNER_PATTERNS: Lazy<Vec<BannerPattern>> = Lazy::new(|| {
    vec![
        pattern("OpenSSH", "ssh", r"(?i)SSH-2\.0-OpenSSH_([^\s]+)"),
        pattern("Apache Tomcat", "http", r"(?i)Tomcat/([^\s]+)"),
        pattern("Apache httpd", "http", r"(?i)Apache/([^\s]+)"),
        pattern("nginx", "http", r"(?i)nginx/([^\s]+)"),
        pattern("Microsoft IIS httpd", "http", r"(?i)IIS/([^\s]+)"),
        pattern("PostgreSQL", "postgresql", r"(?i)PostgreSQL ([^\s]+)"),
        pattern("Redis", "redis", r"(?i)redis_version:([^\s]+)"),
        pattern("MySQL", "mysql", r"(?i)mysql_native_password"),
        pattern("MongoDB", "mongodb", r#"\{"ismaster""#),
    ]
});

/// Product, service name and (when captured) version read from a banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannerMatch {
    pub product: &'static str,
    pub service: &'static str,
    pub version: Option<String>,
}

pub fn match_banner(banner: &str) -> Option<BannerMatch> {
    BANNER_PATTERNS.iter().find_map(|p| {
        let caps = p.regex.captures(banner)?;
        Some(BannerMatch {
            product: p.product,
            service: p.service,
            version: caps
                .get(1)
                .map(|m| m.as_str().trim_end_matches([',', ';', ')']).to_string()),
        })
    })
}

/// Fields to fill in on a service. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

impl Identity {
    pub fn is_empty(&self) -> bool {
        self.service_name.is_none() && self.product.is_none() && self.version.is_none()
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

pub fn identify(service: &Service) -> Identity {
    let hit = service.banner.as_deref().and_then(match_banner);
    let mut identity = Identity::default();

    if blank(&service.service_name) {
        identity.service_name = hit
            .as_ref()
            .map(|h| h.service)
            .or_else(|| well_known_service(service.port))
            .map(str::to_string);
    }
    if let Some(hit) = hit {
        if blank(&service.product) {
            identity.product = Some(hit.product.to_string());
        }
        if blank(&service.version) {
            identity.version = hit.version;
        }
    }
    identity
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifiedService {
    pub service_id: i64,
    pub address: String,
    pub port: i64,
    pub service_name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentifyReport {
    pub examined: usize,
    pub updated: usize,
    pub services: Vec<IdentifiedService>,
}

/// Identifies every given service and stores the outcome as one task result.
pub async fn run(
    pool: &SqlitePool,
    task_id: i64,
    services: &[ServiceWithAddress],
) -> Result<IdentifyReport> {
    let mut report = IdentifyReport {
        examined: services.len(),
        ..Default::default()
    };

    let mut tx = pool.begin().await?;
    for entry in services {
        let service = &entry.service;
        let identity = identify(service);
        if !identity.is_empty() {
            inventory::update_service_identity(
                &mut *tx,
                service.id,
                identity.service_name.as_deref(),
                identity.product.as_deref(),
                identity.version.as_deref(),
            )
            .await?;
            report.updated += 1;
        }
        report.services.push(IdentifiedService {
            service_id: service.id,
            address: entry.address.clone(),
            port: service.port,
            service_name: identity.service_name.or_else(|| service.service_name.clone()),
            product: identity.product.or_else(|| service.product.clone()),
            version: identity.version.or_else(|| service.version.clone()),
        });
    }

    let data = serde_json::to_value(&report).unwrap_or_default();
    results::insert_task_result(&mut *tx, task_id, TOOL_NAME, TOOL_NAME, &data).await?;
    tx.commit().await?;

    debug!(task_id, examined = report.examined, updated = report.updated, "services identified");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::ServiceState;

    fn service(port: i64) -> Service {
        Service {
            id: 1,
            asset_id: 1,
            task_id: None,
            port,
            protocol: "tcp".into(),
            state: ServiceState::Open,
            service_name: None,
            product: None,
            version: None,
            banner: None,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn unnamed_service_gets_the_well_known_name() {
        let identity = identify(&service(6379));
        assert_eq!(identity.service_name.as_deref(), Some("redis"));
        assert_eq!(identity.product, None);
        assert!(identify(&service(31337)).is_empty());
    }

    #[test]
    fn banner_yields_product_and_version() {
        let mut svc = service(2222);
        svc.banner = Some("SSH-2.0-OpenSSH_7.4p1 Debian-10".into());
        let identity = identify(&svc);
        assert_eq!(identity.service_name.as_deref(), Some("ssh"));
        assert_eq!(identity.product.as_deref(), Some("OpenSSH"));
        assert_eq!(identity.version.as_deref(), Some("7.4p1"));
    }

    #[test]
    fn scanner_reported_fields_are_kept() {
        let mut svc = service(80);
        svc.service_name = Some("http".into());
        svc.product = Some("nginx".into());
        svc.banner = Some("Server: nginx/1.14.2".into());
        let identity = identify(&svc);
        assert_eq!(identity.service_name, None);
        assert_eq!(identity.product, None);
        assert_eq!(identity.version.as_deref(), Some("1.14.2"));
    }

    #[test]
    fn tomcat_is_not_mistaken_for_httpd() {
        let hit = match_banner("Server: Apache Tomcat/7.0.52").unwrap();
        assert_eq!(hit.product, "Apache Tomcat");
        assert_eq!(hit.version.as_deref(), Some("7.0.52"));

        let hit = match_banner("Server: Apache/2.4.49 (Unix)").unwrap();
        assert_eq!(hit.product, "Apache httpd");
        assert_eq!(hit.version.as_deref(), Some("2.4.49"));
    }

    #[test]
    fn versionless_patterns_still_name_the_product() {
        let hit = match_banner("\x0a5.7.33\x00 mysql_native_password").unwrap();
        assert_eq!(hit.product, "MySQL");
        assert_eq!(hit.version, None);
    }
}
