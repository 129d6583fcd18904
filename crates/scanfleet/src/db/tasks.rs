use chrono::Utc;
use sqlx::{types::Json, SqliteExecutor, SqlitePool};

use crate::{
    error::Result,
    models::{LogLevel, Page, Task, TaskLog, TaskStatus, TaskType, ToolOptions},
};

const TASK_COLUMNS: &str = "id, name, task_type, target, status, progress, current_step, total_steps, \
     priority, options, assigned_node_id, created_at, started_at, completed_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub task_type: TaskType,
    pub target: String,
    pub priority: i64,
    pub total_steps: i64,
    pub options: ToolOptions,
}

pub async fn insert_task(pool: &SqlitePool, task: &NewTask) -> Result<Task> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO tasks(name, task_type, target, status, progress, total_steps, priority, options, created_at, updated_at) \
         VALUES(?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)",
    )
    .bind(&task.name)
    .bind(task.task_type)
    .bind(&task.target)
    .bind(task.total_steps)
    .bind(task.priority)
    .bind(Json(&task.options))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_task(pool, id)
        .await?
        .ok_or_else(|| sqlx::Error::RowNotFound.into())
}

pub async fn get_task<'e, E: SqliteExecutor<'e>>(executor: E, id: i64) -> Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
    Ok(sqlx::query_as::<_, Task>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?)
}

pub async fn get_status<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: i64,
) -> Result<Option<TaskStatus>> {
    Ok(
        sqlx::query_scalar::<_, TaskStatus>("SELECT status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await?,
    )
}

pub async fn list_tasks(
    pool: &SqlitePool,
    status: Option<TaskStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let rows = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id DESC LIMIT ? OFFSET ?"
            );
            sqlx::query_as::<_, Task>(&sql)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ? OFFSET ?");
            sqlx::query_as::<_, Task>(&sql)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

/// Compare-and-set status change. Returns false when the task was not in any of `from`.
pub async fn transition<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: i64,
    from: &[TaskStatus],
    to: TaskStatus,
) -> Result<bool> {
    if from.is_empty() {
        return Ok(false);
    }
    let now = Utc::now();
    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        "UPDATE tasks SET status = ?, updated_at = ?, \
         started_at = CASE WHEN ? THEN COALESCE(started_at, ?) ELSE started_at END, \
         completed_at = CASE WHEN ? THEN ? ELSE completed_at END \
         WHERE id = ? AND status IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql)
        .bind(to)
        .bind(now)
        .bind(to == TaskStatus::Running)
        .bind(now)
        .bind(to.is_terminal())
        .bind(now)
        .bind(id);
    for status in from {
        query = query.bind(*status);
    }
    let res = query.execute(executor).await?;
    Ok(res.rows_affected() == 1)
}

pub async fn set_progress<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: i64,
    progress: i64,
    step: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET progress = MIN(MAX(?, 0), 100), current_step = COALESCE(?, current_step), updated_at = ? WHERE id = ?",
    )
    .bind(progress)
    .bind(step)
    .bind(Utc::now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_assigned_node<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: i64,
    node_id: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET assigned_node_id = ?, updated_at = ? WHERE id = ?")
        .bind(node_id)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn running_on_node<'e, E: SqliteExecutor<'e>>(
    executor: E,
    node_id: i64,
) -> Result<Vec<i64>> {
    Ok(sqlx::query_scalar::<_, i64>(
        "SELECT id FROM tasks WHERE assigned_node_id = ? AND status = 'running' ORDER BY id",
    )
    .bind(node_id)
    .fetch_all(executor)
    .await?)
}

/// Puts a RUNNING task back to PENDING so it can be started again elsewhere.
pub async fn requeue<'e, E: SqliteExecutor<'e>>(executor: E, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE tasks SET status = 'pending', assigned_node_id = NULL, progress = 0, \
         current_step = 'requeued', updated_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Records the stage a paused task's job stopped before. Fails once the
/// task is no longer PAUSED, so a concurrent resume keeps the job running.
pub async fn park(pool: &SqlitePool, id: i64, stage: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE tasks SET parked_stage = ?, updated_at = ? WHERE id = ? AND status = 'paused'",
    )
    .bind(stage)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Clears and returns the parked stage, if a job stopped while paused.
/// Only one caller gets a given parked stage back.
pub async fn take_parked(pool: &SqlitePool, id: i64) -> Result<Option<i64>> {
    let parked = sqlx::query_scalar::<_, Option<i64>>("SELECT parked_stage FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .flatten();
    let Some(stage) = parked else {
        return Ok(None);
    };
    let res = sqlx::query(
        "UPDATE tasks SET parked_stage = NULL WHERE id = ? AND parked_stage = ?",
    )
    .bind(id)
    .bind(stage)
    .execute(pool)
    .await?;
    Ok((res.rows_affected() == 1).then_some(stage))
}

pub async fn append_log<'e, E: SqliteExecutor<'e>>(
    executor: E,
    task_id: i64,
    level: LogLevel,
    message: &str,
) -> Result<TaskLog> {
    Ok(sqlx::query_as::<_, TaskLog>(
        "INSERT INTO task_logs(task_id, level, message, created_at) VALUES(?, ?, ?, ?) \
         RETURNING id, task_id, level, message, created_at",
    )
    .bind(task_id)
    .bind(level)
    .bind(message)
    .bind(Utc::now())
    .fetch_one(executor)
    .await?)
}

/// Newest-first page of a task's log.
pub async fn logs_page(
    pool: &SqlitePool,
    task_id: i64,
    page: u32,
    page_size: u32,
) -> Result<Page<TaskLog>> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 200);
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_logs WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(pool)
        .await?;
    let items = sqlx::query_as::<_, TaskLog>(
        "SELECT id, task_id, level, message, created_at FROM task_logs \
         WHERE task_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
    )
    .bind(task_id)
    .bind(i64::from(page_size))
    .bind(i64::from(page - 1) * i64::from(page_size))
    .fetch_all(pool)
    .await?;
    Ok(Page {
        total,
        page,
        page_size,
        items,
    })
}

/// The last `limit` entries in chronological order.
pub async fn recent_logs(pool: &SqlitePool, task_id: i64, limit: i64) -> Result<Vec<TaskLog>> {
    let mut rows = sqlx::query_as::<_, TaskLog>(
        "SELECT id, task_id, level, message, created_at FROM task_logs \
         WHERE task_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.reverse();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn new_task() -> NewTask {
        NewTask {
            name: "weekly".into(),
            task_type: TaskType::PortScan,
            target: "10.0.0.0/30".into(),
            priority: 5,
            total_steps: 1,
            options: ToolOptions::default(),
        }
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let pool = test_pool().await;
        let task = insert_task(&pool, &new_task()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(transition(&pool, task.id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap());
        assert!(!transition(&pool, task.id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap());

        let task = get_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn logs_read_back_newest_first() {
        let pool = test_pool().await;
        let task = insert_task(&pool, &new_task()).await.unwrap();
        for i in 0..5 {
            append_log(&pool, task.id, LogLevel::Info, &format!("entry {i}"))
                .await
                .unwrap();
        }

        let page = logs_page(&pool, task.id, 1, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items[0].message, "entry 4");
        assert_eq!(page.items[1].message, "entry 3");

        let recent = recent_logs(&pool, task.id, 3).await.unwrap();
        let messages: Vec<_> = recent.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["entry 2", "entry 3", "entry 4"]);
    }

    #[tokio::test]
    async fn parking_needs_a_paused_task_and_is_taken_once() {
        let pool = test_pool().await;
        let task = insert_task(&pool, &new_task()).await.unwrap();
        transition(&pool, task.id, &[TaskStatus::Pending], TaskStatus::Running)
            .await
            .unwrap();
        assert!(!park(&pool, task.id, 1).await.unwrap());

        transition(&pool, task.id, &[TaskStatus::Running], TaskStatus::Paused)
            .await
            .unwrap();
        assert!(park(&pool, task.id, 1).await.unwrap());
        assert_eq!(take_parked(&pool, task.id).await.unwrap(), Some(1));
        assert_eq!(take_parked(&pool, task.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let pool = test_pool().await;
        let task = insert_task(&pool, &new_task()).await.unwrap();
        set_progress(&pool, task.id, 140, Some("finalize")).await.unwrap();
        let task = get_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(task.progress, 100);
        assert_eq!(task.current_step.as_deref(), Some("finalize"));
    }
}
