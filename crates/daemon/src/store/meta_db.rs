// SQLite handle for ~/.berth/meta.db plus its schema migrations.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "scheduled_tasks",
    sql: r#"
CREATE TABLE scheduled_tasks (
    task_id             TEXT PRIMARY KEY,
    session_id          TEXT NOT NULL,
    tab_id              TEXT NULL,
    workspace_path      TEXT NOT NULL,
    interval_minutes    INTEGER NOT NULL CHECK (interval_minutes > 0),
    prompt              TEXT NOT NULL,
    status              TEXT NOT NULL
        CHECK (status IN ('idle', 'running', 'paused', 'stopped')),
    execution_count     INTEGER NOT NULL DEFAULT 0,
    last_error          TEXT NULL,
    last_run_at         TEXT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX scheduled_tasks_status_idx ON scheduled_tasks (status);
CREATE INDEX scheduled_tasks_session_idx ON scheduled_tasks (session_id);
"#,
}];

/// Another berthd (or the CLI poking at the file) may briefly hold the lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct MetaDb {
    conn: Connection,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open meta.db at `{}`", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;").context("failed to enable WAL for meta.db")?;
        conn.busy_timeout(BUSY_TIMEOUT).context("failed to set meta.db busy timeout")?;
        Self::migrated(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::migrated(Connection::open_in_memory().context("failed to open in-memory meta.db")?)
    }

    fn migrated(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version     INTEGER PRIMARY KEY,
                name        TEXT NOT NULL,
                applied_at  TEXT NOT NULL
            );",
        )
        .context("failed to create schema_migrations")?;

        let current = schema_version(&conn)?;
        let latest = MIGRATIONS.last().map_or(0, |m| m.version);
        if current > latest {
            bail!("meta.db is at schema v{current} but this berthd only knows up to v{latest}; upgrade berthd");
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let tx = conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(migration.sql)
                .with_context(|| format!("meta.db migration v{} ({}) failed", migration.version, migration.name))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.commit().with_context(|| format!("failed to commit migration v{}", migration.version))?;
            info!(version = migration.version, name = migration.name, "applied meta.db migration");
        }
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        schema_version(&self.conn)
    }
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read meta.db schema version")
}
