use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::{
    error::{Result, ScanError},
    models::{Asset, Service, ServiceState, Severity, VulnStatus, Vulnerability, VulnerabilityHistory},
};

const SERVICE_COLUMNS: &str = "id, asset_id, task_id, port, protocol, state, service_name, product, \
     version, banner, discovered_at";

const VULN_COLUMNS: &str = "id, asset_id, task_id, title, description, severity, status, cve_id, \
     source_tool, discovered_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewService<'a> {
    pub asset_id: i64,
    pub task_id: Option<i64>,
    pub port: i64,
    pub protocol: &'a str,
    pub state: ServiceState,
    pub service_name: Option<&'a str>,
    pub product: Option<&'a str>,
    pub version: Option<&'a str>,
    pub banner: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct NewVulnerability<'a> {
    pub asset_id: i64,
    pub task_id: Option<i64>,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub severity: Severity,
    pub cve_id: Option<&'a str>,
    pub source_tool: Option<&'a str>,
}

/// A service row together with its asset's address.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceWithAddress {
    #[sqlx(flatten)]
    pub service: Service,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatistics {
    pub task_id: i64,
    pub tools_executed: Vec<String>,
    pub assets: i64,
    pub services: i64,
    pub vulnerabilities: i64,
    pub severity_distribution: BTreeMap<&'static str, i64>,
}

/// Returns the id of the asset keyed by `address`, creating it on first sight.
/// Hostname and OS are only ever filled in, never cleared.
pub async fn get_or_create_asset<'e, E: SqliteExecutor<'e>>(
    executor: E,
    address: &str,
    hostname: Option<&str>,
    os: Option<&str>,
) -> Result<i64> {
    let now = Utc::now();
    Ok(sqlx::query_scalar::<_, i64>(
        "INSERT INTO assets(address, hostname, os, created_at, updated_at) VALUES(?, ?, ?, ?, ?) \
         ON CONFLICT(address) DO UPDATE SET \
           hostname = COALESCE(excluded.hostname, assets.hostname), \
           os = COALESCE(excluded.os, assets.os), \
           updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(address)
    .bind(hostname)
    .bind(os)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await?)
}

pub async fn insert_service<'e, E: SqliteExecutor<'e>>(
    executor: E,
    service: &NewService<'_>,
) -> Result<i64> {
    let res = sqlx::query(
        "INSERT INTO services(asset_id, task_id, port, protocol, state, service_name, product, version, banner, discovered_at) \
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(service.asset_id)
    .bind(service.task_id)
    .bind(service.port)
    .bind(service.protocol)
    .bind(service.state)
    .bind(service.service_name)
    .bind(service.product)
    .bind(service.version)
    .bind(service.banner)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn insert_vulnerability<'e, E: SqliteExecutor<'e>>(
    executor: E,
    vuln: &NewVulnerability<'_>,
) -> Result<i64> {
    let now = Utc::now();
    let res = sqlx::query(
        "INSERT INTO vulnerabilities(asset_id, task_id, title, description, severity, status, cve_id, source_tool, discovered_at, updated_at) \
         VALUES(?, ?, ?, ?, ?, 'open', ?, ?, ?, ?)",
    )
    .bind(vuln.asset_id)
    .bind(vuln.task_id)
    .bind(vuln.title)
    .bind(vuln.description)
    .bind(vuln.severity)
    .bind(vuln.cve_id)
    .bind(vuln.source_tool)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn list_assets(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Asset>> {
    Ok(sqlx::query_as::<_, Asset>(
        "SELECT id, address, hostname, os, created_at, updated_at FROM assets ORDER BY id DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

pub async fn find_asset(pool: &SqlitePool, address: &str) -> Result<Option<Asset>> {
    Ok(sqlx::query_as::<_, Asset>(
        "SELECT id, address, hostname, os, created_at, updated_at FROM assets WHERE address = ?",
    )
    .bind(address)
    .fetch_optional(pool)
    .await?)
}

pub async fn services_for_asset(pool: &SqlitePool, asset_id: i64) -> Result<Vec<Service>> {
    let sql = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE asset_id = ? ORDER BY id");
    Ok(sqlx::query_as::<_, Service>(&sql)
        .bind(asset_id)
        .fetch_all(pool)
        .await?)
}

/// Open services found by one task.
pub async fn services_for_task(pool: &SqlitePool, task_id: i64) -> Result<Vec<ServiceWithAddress>> {
    Ok(sqlx::query_as::<_, ServiceWithAddress>(
        "SELECT s.id, s.asset_id, s.task_id, s.port, s.protocol, s.state, s.service_name, s.product, \
         s.version, s.banner, s.discovered_at, a.address \
         FROM services s JOIN assets a ON a.id = s.asset_id \
         WHERE s.task_id = ? AND s.state = 'open' ORDER BY s.id",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?)
}

/// Every open service in the inventory; callers narrow it to a target.
pub async fn open_services(pool: &SqlitePool) -> Result<Vec<ServiceWithAddress>> {
    Ok(sqlx::query_as::<_, ServiceWithAddress>(
        "SELECT s.id, s.asset_id, s.task_id, s.port, s.protocol, s.state, s.service_name, s.product, \
         s.version, s.banner, s.discovered_at, a.address \
         FROM services s JOIN assets a ON a.id = s.asset_id \
         WHERE s.state = 'open' ORDER BY s.id",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn update_service_identity<'e, E: SqliteExecutor<'e>>(
    executor: E,
    service_id: i64,
    service_name: Option<&str>,
    product: Option<&str>,
    version: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE services SET service_name = COALESCE(?, service_name), product = COALESCE(?, product), \
         version = COALESCE(?, version) WHERE id = ?",
    )
    .bind(service_name)
    .bind(product)
    .bind(version)
    .bind(service_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_vulnerabilities(
    pool: &SqlitePool,
    severity: Option<Severity>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Vulnerability>> {
    let rows = match severity {
        Some(severity) => {
            let sql = format!(
                "SELECT {VULN_COLUMNS} FROM vulnerabilities WHERE severity = ? ORDER BY id DESC LIMIT ? OFFSET ?"
            );
            sqlx::query_as::<_, Vulnerability>(&sql)
                .bind(severity)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql =
                format!("SELECT {VULN_COLUMNS} FROM vulnerabilities ORDER BY id DESC LIMIT ? OFFSET ?");
            sqlx::query_as::<_, Vulnerability>(&sql)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

/// Changes a vulnerability's status and records the change, both or neither.
pub async fn update_vulnerability_status(
    pool: &SqlitePool,
    id: i64,
    status: VulnStatus,
    note: Option<&str>,
) -> Result<Vulnerability> {
    let mut tx = pool.begin().await?;
    let old: VulnStatus = sqlx::query_scalar("SELECT status FROM vulnerabilities WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ScanError::NotFound(format!("vulnerability {id}")))?;

    if old != status {
        let now = Utc::now();
        sqlx::query("UPDATE vulnerabilities SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO vulnerability_history(vulnerability_id, old_status, new_status, note, changed_at) \
             VALUES(?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(old)
        .bind(status)
        .bind(note)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let sql = format!("SELECT {VULN_COLUMNS} FROM vulnerabilities WHERE id = ?");
    let vuln = sqlx::query_as::<_, Vulnerability>(&sql)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(vuln)
}

pub async fn vulnerability_history(
    pool: &SqlitePool,
    vulnerability_id: i64,
) -> Result<Vec<VulnerabilityHistory>> {
    Ok(sqlx::query_as::<_, VulnerabilityHistory>(
        "SELECT id, vulnerability_id, old_status, new_status, note, changed_at \
         FROM vulnerability_history WHERE vulnerability_id = ? ORDER BY id",
    )
    .bind(vulnerability_id)
    .fetch_all(pool)
    .await?)
}

pub async fn task_statistics(pool: &SqlitePool, task_id: i64) -> Result<TaskStatistics> {
    let tools_executed: Vec<String> =
        sqlx::query_scalar("SELECT tool FROM task_results WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
    let services: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(pool)
        .await?;
    let assets: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT asset_id) FROM ( \
           SELECT asset_id FROM services WHERE task_id = ? \
           UNION ALL SELECT asset_id FROM vulnerabilities WHERE task_id = ?)",
    )
    .bind(task_id)
    .bind(task_id)
    .fetch_one(pool)
    .await?;
    let by_severity: Vec<(Severity, i64)> = sqlx::query_as(
        "SELECT severity, COUNT(*) FROM vulnerabilities WHERE task_id = ? GROUP BY severity",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    let mut severity_distribution: BTreeMap<&'static str, i64> =
        Severity::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    let mut vulnerabilities = 0;
    for (severity, count) in by_severity {
        severity_distribution.insert(severity.as_str(), count);
        vulnerabilities += count;
    }

    Ok(TaskStatistics {
        task_id,
        tools_executed,
        assets,
        services,
        vulnerabilities,
        severity_distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn get_or_create_asset_is_idempotent() {
        let pool = test_pool().await;
        let first = get_or_create_asset(&pool, "10.0.0.5", None, None).await.unwrap();
        let second = get_or_create_asset(&pool, "10.0.0.5", Some("db01"), None)
            .await
            .unwrap();
        assert_eq!(first, second);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets WHERE address = '10.0.0.5'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn asset_details_accrete() {
        let pool = test_pool().await;
        get_or_create_asset(&pool, "10.0.0.6", Some("web01"), None).await.unwrap();
        get_or_create_asset(&pool, "10.0.0.6", None, Some("Linux 5.x")).await.unwrap();

        let asset = find_asset(&pool, "10.0.0.6").await.unwrap().unwrap();
        assert_eq!(asset.hostname.as_deref(), Some("web01"));
        assert_eq!(asset.os.as_deref(), Some("Linux 5.x"));
    }

    #[tokio::test]
    async fn status_change_writes_history() {
        let pool = test_pool().await;
        let asset_id = get_or_create_asset(&pool, "10.0.0.7", None, None).await.unwrap();
        let vuln_id = insert_vulnerability(
            &pool,
            &NewVulnerability {
                asset_id,
                task_id: None,
                title: "Open redirect",
                description: None,
                severity: Severity::Low,
                cve_id: None,
                source_tool: Some("nuclei"),
            },
        )
        .await
        .unwrap();

        let vuln = update_vulnerability_status(&pool, vuln_id, VulnStatus::Fixed, Some("patched"))
            .await
            .unwrap();
        assert_eq!(vuln.status, VulnStatus::Fixed);
        update_vulnerability_status(&pool, vuln_id, VulnStatus::Verified, None)
            .await
            .unwrap();

        let history = vulnerability_history(&pool, vuln_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_status, VulnStatus::Open);
        assert_eq!(history[0].new_status, VulnStatus::Fixed);
        assert_eq!(history[0].note.as_deref(), Some("patched"));
        assert_eq!(history[1].new_status, VulnStatus::Verified);
    }

    #[tokio::test]
    async fn unknown_vulnerability_is_not_found() {
        let pool = test_pool().await;
        let err = update_vulnerability_status(&pool, 42, VulnStatus::Fixed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NotFound(_)));
    }
}
