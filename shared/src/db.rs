/// Database connection pool and helpers for you-get-web.
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{info, warn};

use crate::errors::WebGuiResult;
use crate::models::TaskRecord;

/// Schema generation stamped into the config table.
pub const DB_VERSION: &str = "1.0";

/// Create SQLite connection pool with WAL mode and busy timeout.
pub async fn create_pool(database_url: &str) -> WebGuiResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(10))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    info!("Connected to database: {}", database_url);
    Ok(pool)
}

/// Run migrations from the migrations directory.
pub async fn run_migrations(pool: &SqlitePool) -> WebGuiResult<()> {
    sqlx::migrate!("../migrations").run(pool).await?;

    info!("Database migrations completed");
    Ok(())
}

/// Stamp the schema version on a fresh database, warn when an existing file
/// carries a different one.
pub async fn ensure_db_version(pool: &SqlitePool) -> WebGuiResult<()> {
    match get_setting(pool, "db_version").await? {
        None => {
            set_setting(pool, "db_version", DB_VERSION).await?;
        }
        Some(v) if v != DB_VERSION => {
            warn!("Database version {} does not match expected {}", v, DB_VERSION);
        }
        Some(_) => {}
    }
    Ok(())
}

// ====== TASKS ======

/// Insert a new queued task. Returns the rowid.
pub async fn insert_task(
    pool: &SqlitePool,
    origin: &str,
    options_json: &str,
    priority: i64,
) -> WebGuiResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO tasks (origin, options, priority, status)
        VALUES (?, ?, ?, 'queued')
        "#,
    )
    .bind(origin)
    .bind(options_json)
    .bind(priority)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Get a single task by rowid.
pub async fn get_task(pool: &SqlitePool, task_id: i64) -> WebGuiResult<Option<TaskRecord>> {
    let task = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// Get a task by its origin URL.
pub async fn get_task_by_origin(pool: &SqlitePool, origin: &str) -> WebGuiResult<Option<TaskRecord>> {
    let task = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE origin = ?")
        .bind(origin)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// List tasks for the GUI, optionally filtered by status.
pub async fn list_tasks(pool: &SqlitePool, status: Option<&str>) -> WebGuiResult<Vec<TaskRecord>> {
    let tasks = if let Some(s) = status {
        sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE status = ? ORDER BY id ASC",
        )
        .bind(s)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks ORDER BY id ASC")
            .fetch_all(pool)
            .await?
    };

    Ok(tasks)
}

/// Rows worth putting back on the queue after a restart: anything that was
/// waiting or mid-download, plus errored rows with retry budget left.
/// Stopped rows stay stopped until the user restarts them.
pub async fn load_resumable_tasks(pool: &SqlitePool, max_retry: i64) -> WebGuiResult<Vec<TaskRecord>> {
    let tasks = sqlx::query_as::<_, TaskRecord>(
        r#"
        SELECT * FROM tasks
        WHERE status IN ('queued', 'running')
           OR (status = 'error' AND failures < ?)
        ORDER BY priority ASC, id ASC
        "#,
    )
    .bind(max_retry)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Mark a task as running.
pub async fn mark_task_running(pool: &SqlitePool, task_id: i64) -> WebGuiResult<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'running', updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update byte counters for a running task.
pub async fn update_task_progress(
    pool: &SqlitePool,
    task_id: i64,
    received: i64,
    total_size: i64,
) -> WebGuiResult<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET received = ?, total_size = ?, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(received)
    .bind(total_size)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the title reported by the engine.
pub async fn set_task_title(pool: &SqlitePool, task_id: i64, title: &str) -> WebGuiResult<()> {
    sqlx::query("UPDATE tasks SET title = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(title)
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Record the primary artifact path reported by the engine.
pub async fn set_task_filepath(pool: &SqlitePool, task_id: i64, filepath: &str) -> WebGuiResult<()> {
    sqlx::query("UPDATE tasks SET filepath = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(filepath)
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Mark a task as completed. Byte counters are squared up so the GUI shows
/// 100% even when the engine skipped an already-present file.
pub async fn complete_task(pool: &SqlitePool, task_id: i64, filepath: Option<&str>) -> WebGuiResult<()> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'done',
            filepath = COALESCE(?, filepath),
            received = CASE WHEN total_size > 0 THEN total_size ELSE received END,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(filepath)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a task as failed and bump its failure count. Returns the new count.
pub async fn fail_task(pool: &SqlitePool, task_id: i64) -> WebGuiResult<i64> {
    sqlx::query(
        r#"
        UPDATE tasks SET status = 'error', failures = failures + 1,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    let (failures,): (i64,) = sqlx::query_as("SELECT failures FROM tasks WHERE id = ?")
        .bind(task_id)
        .fetch_one(pool)
        .await?;

    Ok(failures)
}

/// Stop a waiting or running task. Returns false when it was already
/// finished.
pub async fn stop_task(pool: &SqlitePool, task_id: i64) -> WebGuiResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET status = 'stopped', updated_at = CURRENT_TIMESTAMP
        WHERE id = ? AND status IN ('queued', 'running')
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Put an errored task back in the queue without touching its failure count.
pub async fn requeue_task(pool: &SqlitePool, task_id: i64) -> WebGuiResult<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'queued', updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Reset a task for a fresh run: queued, zero counters, zero failures.
/// Returns false for unknown ids.
pub async fn reset_task(pool: &SqlitePool, task_id: i64) -> WebGuiResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'queued', failures = 0, received = 0, total_size = 0,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Replace stored submission options and priority. Used when a finished
/// origin is submitted again with different settings.
pub async fn set_task_options(
    pool: &SqlitePool,
    task_id: i64,
    options_json: &str,
    priority: i64,
) -> WebGuiResult<()> {
    sqlx::query(
        "UPDATE tasks SET options = ?, priority = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(options_json)
    .bind(priority)
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a task row. Downloaded files are left in place.
pub async fn delete_task(pool: &SqlitePool, task_id: i64) -> WebGuiResult<()> {
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Delete every task in the given status. Returns how many rows went away.
pub async fn clear_tasks_by_status(pool: &SqlitePool, status: &str) -> WebGuiResult<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE status = ?")
        .bind(status)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Queue counters for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskCounts {
    pub total: i64,
    pub queued: i64,
    pub running: i64,
    pub done: i64,
    pub error: i64,
    pub stopped: i64,
}

/// Count tasks per status.
pub async fn count_tasks(pool: &SqlitePool) -> WebGuiResult<TaskCounts> {
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
        .fetch_one(pool)
        .await?;
    let (queued,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'queued'")
        .fetch_one(pool)
        .await?;
    let (running,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'running'")
        .fetch_one(pool)
        .await?;
    let (done,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'done'")
        .fetch_one(pool)
        .await?;
    let (error,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'error'")
        .fetch_one(pool)
        .await?;
    let (stopped,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'stopped'")
        .fetch_one(pool)
        .await?;

    Ok(TaskCounts {
        total,
        queued,
        running,
        done,
        error,
        stopped,
    })
}

// ====== SETTINGS ======

/// Read one settings value.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> WebGuiResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.0))
}

/// Write one settings value.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> WebGuiResult<()> {
    sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;

    Ok(())
}

/// All settings sharing a key prefix, prefix stripped.
pub async fn settings_with_prefix(
    pool: &SqlitePool,
    prefix: &str,
) -> WebGuiResult<Vec<(String, String)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM config WHERE key LIKE ? || '%' ORDER BY key")
            .bind(prefix)
            .fetch_all(pool)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(k, v)| (k[prefix.len()..].to_string(), v))
        .collect())
}

// ====== MAINTENANCE ======

/// Megabyte of reclaimable pages before a vacuum is worth the pause.
const VACUUM_MIN_FREE_BYTES: i64 = 1024 * 1024;
/// Freelist share of the file before a vacuum is worth the pause.
const VACUUM_MIN_FREE_RATIO: f64 = 0.25;

/// Vacuum the database when enough of it is reclaimable. Returns whether a
/// vacuum actually ran.
pub async fn try_vacuum(pool: &SqlitePool) -> WebGuiResult<bool> {
    let (freelist,): (i64,) = sqlx::query_as("PRAGMA freelist_count")
        .fetch_one(pool)
        .await?;
    let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
        .fetch_one(pool)
        .await?;
    let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
        .fetch_one(pool)
        .await?;

    if !should_vacuum(freelist, page_count, page_size) {
        return Ok(false);
    }

    sqlx::query("VACUUM").execute(pool).await?;
    info!(
        "Vacuumed database: reclaimed {} free pages of {}",
        freelist, page_count
    );
    Ok(true)
}

fn should_vacuum(freelist: i64, page_count: i64, page_size: i64) -> bool {
    if page_count <= 0 {
        return false;
    }
    let ratio = freelist as f64 / page_count as f64;
    ratio > VACUUM_MIN_FREE_RATIO && freelist * page_size > VACUUM_MIN_FREE_BYTES
}
