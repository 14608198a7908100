// Scheduled task persistence: CRUD + recovery queries.
//
// Task rows are the only durable state; ownership and activation are rebuilt
// from `running`/`paused` rows at startup.

use std::path::PathBuf;

use anyhow::{Context, Result};
use berth_common::types::{ScheduledTask, SessionId, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const SELECT_COLUMNS: &str = "task_id, session_id, tab_id, workspace_path, interval_minutes, \
     prompt, status, execution_count, last_error, last_run_at, created_at, updated_at";

/// Stateless CRUD operations on the `scheduled_tasks` table.
pub struct TaskStore;

impl TaskStore {
    pub fn create(conn: &Connection, task: &ScheduledTask) -> Result<()> {
        conn.execute(
            "INSERT INTO scheduled_tasks \
             (task_id, session_id, tab_id, workspace_path, interval_minutes, prompt, status, \
              execution_count, last_error, last_run_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.session_id.as_str(),
                task.tab_id,
                task.workspace_path.to_string_lossy().into_owned(),
                task.interval_minutes,
                task.prompt,
                task.status.as_str(),
                task.execution_count,
                task.last_error,
                task.last_run_at.map(|at| at.to_rfc3339()),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .context("failed to insert scheduled task")?;
        Ok(())
    }

    pub fn get(conn: &Connection, task_id: &str) -> Result<Option<ScheduledTask>> {
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM scheduled_tasks WHERE task_id = ?1"),
            params![task_id],
            row_to_task,
        )
        .optional()
        .context("failed to query scheduled task")
    }

    /// All tasks, oldest first.
    pub fn list(conn: &Connection) -> Result<Vec<ScheduledTask>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM scheduled_tasks ORDER BY created_at ASC, task_id ASC"
            ))
            .context("failed to prepare task list query")?;
        let rows = stmt.query_map([], row_to_task).context("failed to query scheduled tasks")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect scheduled tasks")
    }

    /// Tasks that held a claim before shutdown (`running` or `paused`).
    pub fn list_recoverable(conn: &Connection) -> Result<Vec<ScheduledTask>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM scheduled_tasks \
                 WHERE status IN ('running', 'paused') ORDER BY created_at ASC, task_id ASC"
            ))
            .context("failed to prepare recoverable task query")?;
        let rows =
            stmt.query_map([], row_to_task).context("failed to query recoverable tasks")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect recoverable tasks")
    }

    pub fn update_status(
        conn: &Connection,
        task_id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
                params![status.as_str(), now.to_rfc3339(), task_id],
            )
            .context("failed to update task status")?;
        Ok(changed > 0)
    }

    /// Count a successful run and clear any previous error.
    pub fn record_execution(conn: &Connection, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks \
                 SET execution_count = execution_count + 1, last_run_at = ?1, \
                     last_error = NULL, updated_at = ?1 \
                 WHERE task_id = ?2",
                params![now.to_rfc3339(), task_id],
            )
            .context("failed to record task execution")?;
        Ok(changed > 0)
    }

    pub fn set_last_error(
        conn: &Connection,
        task_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks SET last_error = ?1, updated_at = ?2 WHERE task_id = ?3",
                params![error, now.to_rfc3339(), task_id],
            )
            .context("failed to record task error")?;
        Ok(changed > 0)
    }

    /// Point every task bound to `old` at `new`. Returns the number of rows moved.
    pub fn rekey_session(
        conn: &Connection,
        old: &SessionId,
        new: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        conn.execute(
            "UPDATE scheduled_tasks SET session_id = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![new.as_str(), now.to_rfc3339(), old.as_str()],
        )
        .context("failed to rekey scheduled tasks")
    }

    pub fn delete(conn: &Connection, task_id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM scheduled_tasks WHERE task_id = ?1", params![task_id])
            .context("failed to delete scheduled task")?;
        Ok(changed > 0)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let session_raw: String = row.get(1)?;
    let workspace_raw: String = row.get(3)?;
    let status_raw: String = row.get(6)?;
    let last_run_raw: Option<String> = row.get(9)?;
    let created_raw: String = row.get(10)?;
    let updated_raw: String = row.get(11)?;

    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("invalid task status `{status_raw}`").into(),
        )
    })?;

    Ok(ScheduledTask {
        id: row.get(0)?,
        session_id: SessionId::new(session_raw),
        tab_id: row.get(2)?,
        workspace_path: PathBuf::from(workspace_raw),
        interval_minutes: row.get(4)?,
        prompt: row.get(5)?,
        status,
        execution_count: row.get(7)?,
        last_error: row.get(8)?,
        last_run_at: last_run_raw.as_deref().map(|raw| parse_timestamp(9, raw)).transpose()?,
        created_at: parse_timestamp(10, &created_raw)?,
        updated_at: parse_timestamp(11, &updated_raw)?,
    })
}
