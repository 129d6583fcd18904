use chrono::Utc;
use serde_json::Value;
use sqlx::{types::Json, SqliteExecutor, SqlitePool};

use crate::{error::Result, models::TaskResult};

pub async fn insert_task_result<'e, E: SqliteExecutor<'e>>(
    executor: E,
    task_id: i64,
    tool: &str,
    result_type: &str,
    result_data: &Value,
) -> Result<i64> {
    let res = sqlx::query(
        "INSERT INTO task_results(task_id, tool, result_type, result_data, created_at) VALUES(?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(tool)
    .bind(result_type)
    .bind(Json(result_data))
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn list_task_results(
    pool: &SqlitePool,
    task_id: i64,
    tool: Option<&str>,
) -> Result<Vec<TaskResult>> {
    Ok(sqlx::query_as::<_, TaskResult>(
        "SELECT id, task_id, tool, result_type, result_data, created_at FROM task_results \
         WHERE task_id = ? AND (? IS NULL OR tool = ?) ORDER BY id",
    )
    .bind(task_id)
    .bind(tool)
    .bind(tool)
    .fetch_all(pool)
    .await?)
}
