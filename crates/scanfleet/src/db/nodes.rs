use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::{
    error::Result,
    models::{Node, NodeStatus, NodeType},
};

const NODE_COLUMNS: &str = "id, name, host, port, node_type, status, capacity, current_tasks, \
     cpu_usage, memory_usage, disk_usage, api_version, last_heartbeat, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub host: String,
    pub port: i64,
    pub node_type: NodeType,
    pub capacity: i64,
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceGauges {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

/// Inserts the node unless one with the same name exists. Returns the stored
/// row and whether it was created by this call.
pub async fn insert_if_absent(pool: &SqlitePool, node: &NewNode) -> Result<(Node, bool)> {
    let now = Utc::now();
    let res = sqlx::query(
        "INSERT INTO nodes(name, host, port, node_type, status, capacity, current_tasks, api_version, created_at, updated_at) \
         VALUES(?, ?, ?, ?, 'offline', ?, 0, ?, ?, ?) ON CONFLICT(name) DO NOTHING",
    )
    .bind(&node.name)
    .bind(&node.host)
    .bind(node.port)
    .bind(node.node_type)
    .bind(node.capacity)
    .bind(&node.api_version)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let stored = get_by_name(pool, &node.name)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    Ok((stored, res.rows_affected() == 1))
}

pub async fn get_node<'e, E: SqliteExecutor<'e>>(executor: E, id: i64) -> Result<Option<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?");
    Ok(sqlx::query_as::<_, Node>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?)
}

pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE name = ?");
    Ok(sqlx::query_as::<_, Node>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await?)
}

pub async fn list_nodes(pool: &SqlitePool) -> Result<Vec<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id");
    Ok(sqlx::query_as::<_, Node>(&sql).fetch_all(pool).await?)
}

/// Online nodes of one type, least loaded first.
pub async fn online_of_type(pool: &SqlitePool, node_type: NodeType) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE status = 'online' AND node_type = ? \
         ORDER BY current_tasks ASC, cpu_usage ASC, id ASC"
    );
    Ok(sqlx::query_as::<_, Node>(&sql)
        .bind(node_type)
        .fetch_all(pool)
        .await?)
}

/// A node in maintenance keeps that status; any other node comes online.
pub async fn record_heartbeat(
    pool: &SqlitePool,
    id: i64,
    gauges: ResourceGauges,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE nodes SET status = CASE WHEN status = 'maintenance' THEN status ELSE 'online' END, \
         cpu_usage = ?, memory_usage = ?, disk_usage = ?, last_heartbeat = ?, updated_at = ? WHERE id = ?",
    )
    .bind(gauges.cpu_usage)
    .bind(gauges.memory_usage)
    .bind(gauges.disk_usage)
    .bind(at)
    .bind(at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Takes one slot; a single conditional UPDATE so concurrent callers in other
/// processes cannot push the counter past capacity.
pub async fn try_reserve(pool: &SqlitePool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE nodes SET current_tasks = current_tasks + 1, updated_at = ? \
         WHERE id = ? AND current_tasks < capacity",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn release(pool: &SqlitePool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE nodes SET current_tasks = MAX(current_tasks - 1, 0), updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn set_status(pool: &SqlitePool, id: i64, status: NodeStatus) -> Result<bool> {
    let res = sqlx::query("UPDATE nodes SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Online nodes whose last heartbeat is older than `cutoff` (or missing).
pub async fn stale_online(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE status = 'online' \
         AND (last_heartbeat IS NULL OR last_heartbeat < ?) ORDER BY id"
    );
    Ok(sqlx::query_as::<_, Node>(&sql)
        .bind(cutoff)
        .fetch_all(pool)
        .await?)
}

/// Flips a node offline unless it heartbeated since `cutoff`.
pub async fn mark_offline_if_stale<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: i64,
    cutoff: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE nodes SET status = 'offline', current_tasks = 0, updated_at = ? \
         WHERE id = ? AND status = 'online' AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
    )
    .bind(Utc::now())
    .bind(id)
    .bind(cutoff)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn delete_if_idle(pool: &SqlitePool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM nodes WHERE id = ? AND current_tasks = 0")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[cfg(test)]
pub async fn force_heartbeat(pool: &SqlitePool, id: i64, at: DateTime<Utc>) {
    sqlx::query("UPDATE nodes SET status = 'online', last_heartbeat = ? WHERE id = ?")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await
        .expect("force heartbeat");
}
