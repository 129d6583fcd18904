//! Turns adapter outcomes into inventory rows. Every call stores the raw
//! result and its findings in one transaction. Rows are appended, never
//! merged: only assets are shared, by address.

use std::collections::HashSet;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::{
    adapters::Outcome,
    db::{
        inventory::{self, NewService, NewVulnerability},
        results,
    },
    error::Result,
    models::{MatchRecord, ParsedRecord, PathRecord, PortRecord, ServiceState, Severity},
    security::{extract_host, TargetSpec},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeSummary {
    pub assets_touched: usize,
    pub services_found: usize,
    pub vulnerabilities_found: usize,
    pub task_result_id: i64,
}

#[derive(Clone)]
pub struct Normalizer {
    pool: SqlitePool,
    port_exposure_findings: bool,
}

impl Normalizer {
    pub fn new(pool: SqlitePool, port_exposure_findings: bool) -> Self {
        Self {
            pool,
            port_exposure_findings,
        }
    }

    pub async fn normalize(&self, task_id: i64, outcome: &Outcome) -> Result<NormalizeSummary> {
        let fallback_host = TargetSpec::parse(&outcome.target)
            .ok()
            .filter(|t| !matches!(t, TargetSpec::Network(_)))
            .map(|t| t.host());

        let mut tx = self.pool.begin().await?;
        let result_data = serde_json::to_value(outcome).unwrap_or_default();
        let task_result_id = results::insert_task_result(
            &mut *tx,
            task_id,
            &outcome.tool,
            &format!("tool_{}", outcome.tool),
            &result_data,
        )
        .await?;

        let mut summary = NormalizeSummary {
            task_result_id,
            ..Default::default()
        };
        if !outcome.produced_findings() {
            tx.commit().await?;
            return Ok(summary);
        }

        let mut assets = HashSet::new();
        for record in &outcome.parsed {
            match record {
                ParsedRecord::OpenPort(port) => {
                    let asset_id = inventory::get_or_create_asset(
                        &mut *tx,
                        &port.address,
                        port.hostname.as_deref(),
                        port.os.as_deref(),
                    )
                    .await?;
                    assets.insert(asset_id);
                    inventory::insert_service(&mut *tx, &new_service(asset_id, task_id, port))
                        .await?;
                    summary.services_found += 1;

                    if self.port_exposure_findings {
                        let title = format!("Open port {}/{}", port.port, port.protocol);
                        let description = format!(
                            "Service detected: {} {}",
                            port.service_name.as_deref().unwrap_or("unknown"),
                            port.version.as_deref().unwrap_or_default()
                        );
                        inventory::insert_vulnerability(
                            &mut *tx,
                            &NewVulnerability {
                                asset_id,
                                task_id: Some(task_id),
                                title: &title,
                                description: Some(description.trim_end()),
                                severity: Severity::Info,
                                cve_id: None,
                                source_tool: Some(outcome.tool.as_str()),
                            },
                        )
                        .await?;
                        summary.vulnerabilities_found += 1;
                    }
                }
                ParsedRecord::Match(found) => {
                    let Some(host) = match_host(found, fallback_host.as_deref()) else {
                        warn!(tool = %outcome.tool, name = %found.name, "match without a host skipped");
                        continue;
                    };
                    let asset_id =
                        inventory::get_or_create_asset(&mut *tx, &host, None, None).await?;
                    assets.insert(asset_id);
                    let description = match_description(&outcome.tool, found);
                    inventory::insert_vulnerability(
                        &mut *tx,
                        &NewVulnerability {
                            asset_id,
                            task_id: Some(task_id),
                            title: &found.name,
                            description: Some(description.as_str()),
                            severity: Severity::from_tool(found.severity.as_deref()),
                            cve_id: found.cve_id.as_deref(),
                            source_tool: Some(outcome.tool.as_str()),
                        },
                    )
                    .await?;
                    summary.vulnerabilities_found += 1;
                }
                ParsedRecord::Path(path) => {
                    let Some(host) = path_host(path, fallback_host.as_deref()) else {
                        warn!(tool = %outcome.tool, path = %path.path, "path without a host skipped");
                        continue;
                    };
                    let asset_id =
                        inventory::get_or_create_asset(&mut *tx, &host, None, None).await?;
                    assets.insert(asset_id);
                    let title = format!("Directory discovered: {}", path.path);
                    let status = path
                        .status
                        .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                    let description = format!("HTTP status: {status}\nPath: {}", path.path);
                    inventory::insert_vulnerability(
                        &mut *tx,
                        &NewVulnerability {
                            asset_id,
                            task_id: Some(task_id),
                            title: &title,
                            description: Some(description.as_str()),
                            severity: Severity::Info,
                            cve_id: None,
                            source_tool: Some(outcome.tool.as_str()),
                        },
                    )
                    .await?;
                    summary.vulnerabilities_found += 1;
                }
            }
        }

        tx.commit().await?;
        summary.assets_touched = assets.len();
        debug!(task_id, tool = %outcome.tool, ?summary, "outcome normalized");
        Ok(summary)
    }
}

fn new_service(asset_id: i64, task_id: i64, port: &PortRecord) -> NewService<'_> {
    NewService {
        asset_id,
        task_id: Some(task_id),
        port: i64::from(port.port),
        protocol: &port.protocol,
        state: ServiceState::Open,
        service_name: port.service_name.as_deref(),
        product: port.product.as_deref(),
        version: port.version.as_deref(),
        banner: port.banner.as_deref(),
    }
}

fn match_host(found: &MatchRecord, fallback: Option<&str>) -> Option<String> {
    found
        .matched_at
        .as_deref()
        .and_then(extract_host)
        .or_else(|| fallback.map(str::to_string))
}

fn path_host(path: &PathRecord, fallback: Option<&str>) -> Option<String> {
    path.url
        .as_deref()
        .and_then(extract_host)
        .or_else(|| fallback.map(str::to_string))
}

fn match_description(tool: &str, found: &MatchRecord) -> String {
    let mut text = format!(
        "Detected by {tool}\nMatched: {}",
        found.matched_at.as_deref().unwrap_or("N/A")
    );
    if let Some(template) = &found.template_id {
        text.push_str(&format!("\nTemplate: {template}"));
    }
    if let Some(details) = &found.description {
        text.push('\n');
        text.push_str(details);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::OutcomeStatus,
        db::{
            inventory::find_asset,
            results::list_task_results,
            tasks::{insert_task, NewTask},
            test_pool,
        },
        models::{TaskType, ToolOptions},
    };

    async fn task(pool: &SqlitePool) -> i64 {
        insert_task(
            pool,
            &NewTask {
                name: "normalize".into(),
                task_type: TaskType::PortScan,
                target: "10.0.0.0/24".into(),
                priority: 5,
                total_steps: 1,
                options: ToolOptions::default(),
            },
        )
        .await
        .unwrap()
        .id
    }

    fn port(address: &str, port: u16) -> ParsedRecord {
        ParsedRecord::OpenPort(PortRecord {
            address: address.into(),
            hostname: None,
            port,
            protocol: "tcp".into(),
            service_name: None,
            product: None,
            version: None,
            banner: None,
            os: None,
        })
    }

    fn outcome(tool: &str, target: &str, parsed: Vec<ParsedRecord>) -> Outcome {
        Outcome {
            tool: tool.into(),
            target: target.into(),
            status: OutcomeStatus::Success,
            reason: None,
            exit_code: Some(0),
            raw: String::new(),
            parsed,
        }
    }

    async fn count(pool: &SqlitePool, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    #[tokio::test]
    async fn replaying_a_port_scan_reuses_the_asset_and_appends_services() {
        let pool = test_pool().await;
        let task_id = task(&pool).await;
        let normalizer = Normalizer::new(pool.clone(), false);
        let scan = outcome(
            "nmap",
            "10.0.0.5",
            vec![port("10.0.0.5", 22), port("10.0.0.5", 80), port("10.0.0.5", 443)],
        );

        let first = normalizer.normalize(task_id, &scan).await.unwrap();
        let second = normalizer.normalize(task_id, &scan).await.unwrap();
        assert_eq!(first.assets_touched, 1);
        assert_eq!(first.services_found, 3);
        assert_eq!(second.services_found, 3);

        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assets WHERE address = '10.0.0.5'").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM services").await, 6);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM vulnerabilities").await, 0);

        let stored = list_task_results(&pool, task_id, Some("nmap")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].result_type, "tool_nmap");
    }

    #[tokio::test]
    async fn exposure_findings_are_opt_in() {
        let pool = test_pool().await;
        let task_id = task(&pool).await;
        let normalizer = Normalizer::new(pool.clone(), true);
        let scan = outcome("fscan", "10.0.0.6", vec![port("10.0.0.6", 6379)]);

        let summary = normalizer.normalize(task_id, &scan).await.unwrap();
        assert_eq!(summary.vulnerabilities_found, 1);
        let title: String = sqlx::query_scalar("SELECT title FROM vulnerabilities")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(title, "Open port 6379/tcp");
    }

    #[tokio::test]
    async fn matches_map_severity_and_host() {
        let pool = test_pool().await;
        let task_id = task(&pool).await;
        let normalizer = Normalizer::new(pool.clone(), false);
        let scan = outcome(
            "nuclei",
            "https://a.b:8443",
            vec![
                ParsedRecord::Match(MatchRecord {
                    matched_at: Some("https://a.b:8443/x".into()),
                    name: "Weird finding".into(),
                    severity: Some("weird".into()),
                    cve_id: Some("CVE-2021-41773".into()),
                    template_id: None,
                    description: None,
                }),
                ParsedRecord::Match(MatchRecord {
                    matched_at: None,
                    name: "Info finding".into(),
                    severity: Some("informational".into()),
                    cve_id: None,
                    template_id: None,
                    description: None,
                }),
            ],
        );

        let summary = normalizer.normalize(task_id, &scan).await.unwrap();
        assert_eq!(summary.assets_touched, 1);
        assert_eq!(summary.vulnerabilities_found, 2);

        let asset = find_asset(&pool, "a.b").await.unwrap().unwrap();
        let rows: Vec<(String, Severity, Option<String>)> = sqlx::query_as(
            "SELECT title, severity, cve_id FROM vulnerabilities WHERE asset_id = ? ORDER BY id",
        )
        .bind(asset.id)
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(rows[0].1, Severity::Medium);
        assert_eq!(rows[0].2.as_deref(), Some("CVE-2021-41773"));
        assert_eq!(rows[1].1, Severity::Info);
    }

    #[tokio::test]
    async fn paths_become_info_findings() {
        let pool = test_pool().await;
        let task_id = task(&pool).await;
        let normalizer = Normalizer::new(pool.clone(), false);
        let scan = outcome(
            "dirsearch",
            "http://app.lab.local/",
            vec![ParsedRecord::Path(PathRecord {
                url: Some("http://app.lab.local/admin/".into()),
                path: "/admin/".into(),
                status: Some(200),
                content_length: Some(1543),
            })],
        );

        normalizer.normalize(task_id, &scan).await.unwrap();
        let (severity, description): (Severity, String) =
            sqlx::query_as("SELECT severity, description FROM vulnerabilities")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(severity, Severity::Info);
        assert_eq!(description, "HTTP status: 200\nPath: /admin/");
    }

    #[tokio::test]
    async fn error_outcomes_store_raw_output_only() {
        let pool = test_pool().await;
        let task_id = task(&pool).await;
        let normalizer = Normalizer::new(pool.clone(), false);
        let mut failed = outcome("nmap", "10.0.0.5", vec![port("10.0.0.5", 22)]);
        failed.status = OutcomeStatus::Error;

        let summary = normalizer.normalize(task_id, &failed).await.unwrap();
        assert_eq!(summary.services_found, 0);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assets").await, 0);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM task_results").await, 1);
    }
}
