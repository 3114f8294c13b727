//! SQLite registry for persistent project state
//!
//! Holds one row per project (last access time and lifecycle status) plus an
//! append-only access log. Everything the agent needs to survive a restart
//! lives here.

use crate::error::RegistryError;
use chrono::Utc;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// How long a statement waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Result<T> = std::result::Result<T, RegistryError>;

/// Lifecycle status of a project as tracked by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ProjectStatus::Stopped),
            "starting" => Ok(ProjectStatus::Starting),
            "running" => Ok(ProjectStatus::Running),
            other => Err(RegistryError::UnknownStatus(other.to_string())),
        }
    }
}

impl ToSql for ProjectStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProjectStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: RegistryError| FromSqlError::Other(Box::new(e)))
    }
}

/// Project row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectRecord {
    pub name: String,
    /// Unix milliseconds
    pub last_access_at: i64,
    pub status: ProjectStatus,
}

/// Access log row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessLogEntry {
    /// Assigned by the registry, 0 before insertion
    pub id: i64,
    pub project: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub client_ip: String,
    pub user_agent: String,
    pub path: String,
}

impl AccessLogEntry {
    pub fn new(
        project: impl Into<String>,
        client_ip: impl Into<String>,
        user_agent: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            project: project.into(),
            timestamp: now_ms(),
            client_ip: client_ip.into(),
            user_agent: user_agent.into(),
            path: path.into(),
        }
    }
}

/// Current time in unix milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Registry connection wrapper with thread-safe access.
/// After [`close`](Self::close) every operation fails with `Closed`.
pub struct Registry {
    conn: Mutex<Option<Connection>>,
}

impl Registry {
    /// Open or create a registry at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let open_err = |source| RegistryError::Open {
            path: path.to_path_buf(),
            source,
        };

        let conn = Connection::open(path).map_err(open_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(open_err)?;

        let registry = Self {
            conn: Mutex::new(Some(conn)),
        };
        registry.run_migrations()?;

        info!(path = %path.display(), "Registry opened");
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let registry = Self {
            conn: Mutex::new(Some(conn)),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    // ==================== Project Operations ====================

    /// Record a request for a project. Absent or stopped projects become
    /// running; a project that is starting stays starting.
    pub fn upsert_access(&self, name: &str) -> Result<()> {
        self.record_access_at(name, now_ms())
    }

    /// Same as [`upsert_access`](Self::upsert_access) with an explicit timestamp
    pub fn record_access_at(&self, name: &str, timestamp_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO projects (name, last_access_at, status) VALUES (?1, ?2, 'running')
             ON CONFLICT(name) DO UPDATE SET
                last_access_at = excluded.last_access_at,
                status = CASE WHEN projects.status = 'starting' THEN 'starting' ELSE 'running' END",
            params![name, timestamp_ms],
        )?;
        Ok(())
    }

    /// Get a project by name
    pub fn get_project(&self, name: &str) -> Result<Option<ProjectRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT name, last_access_at, status FROM projects WHERE name = ?1",
                params![name],
                row_to_project,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_status(&self, name: &str) -> Result<Option<ProjectStatus>> {
        Ok(self.get_project(name)?.map(|p| p.status))
    }

    /// Set a project's status, creating the row if needed
    pub fn set_status(&self, name: &str, status: ProjectStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO projects (name, last_access_at, status) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET status = excluded.status",
            params![name, now_ms(), status],
        )?;
        Ok(())
    }

    /// Move a project to `starting` unless it already is.
    ///
    /// Returns `true` when this call performed the transition. The check and
    /// the write happen in a single statement under the connection lock, so two
    /// concurrent callers can never both get `true`.
    pub fn begin_starting(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO projects (name, last_access_at, status) VALUES (?1, ?2, 'starting')
             ON CONFLICT(name) DO UPDATE SET status = 'starting'
             WHERE projects.status != 'starting'",
            params![name, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// Mark a project stopped only while it is still `running`.
    ///
    /// Returns `false` when the row moved on (typically to `starting` because
    /// a wake arrived) so the caller must not overwrite it.
    pub fn stop_if_running(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE projects SET status = 'stopped' WHERE name = ?1 AND status = 'running'",
            params![name],
        )?;
        Ok(changed == 1)
    }

    /// Running projects whose last access is older than `threshold`
    pub fn idle_since(&self, threshold: Duration) -> Result<Vec<ProjectRecord>> {
        self.idle_since_at(threshold, now_ms())
    }

    pub fn idle_since_at(&self, threshold: Duration, now_ms: i64) -> Result<Vec<ProjectRecord>> {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(threshold_ms);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, last_access_at, status FROM projects
             WHERE status = 'running' AND last_access_at < ?1
             ORDER BY last_access_at ASC",
        )?;

        let records = stmt
            .query_map(params![cutoff], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// List all projects
    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, last_access_at, status FROM projects ORDER BY name")?;

        let records = stmt
            .query_map([], row_to_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Reset projects left in `starting` by a previous run to `stopped`
    pub fn reset_starting(&self) -> Result<usize> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE projects SET status = 'stopped' WHERE status = 'starting'",
            [],
        )?;
        Ok(rows)
    }

    // ==================== Access Log Operations ====================

    /// Append an access log row, returning its id
    pub fn append_access_log(&self, entry: &AccessLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO access_logs (project, timestamp, client_ip, user_agent, path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.project,
                entry.timestamp,
                entry.client_ip,
                entry.user_agent,
                entry.path
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent access log rows for a project, newest first
    pub fn recent_access_logs(&self, project: &str, limit: usize) -> Result<Vec<AccessLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, project, timestamp, client_ip, user_agent, path
             FROM access_logs WHERE project = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![project, limit as i64], |row| {
                Ok(AccessLogEntry {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    timestamp: row.get(2)?,
                    client_ip: row.get(3)?,
                    user_agent: row.get(4)?,
                    path: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete access log rows older than `days` days
    pub fn prune_logs_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = now_ms() - i64::from(days) * 86_400_000;
        self.prune_logs_before(cutoff)
    }

    pub fn prune_logs_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM access_logs WHERE timestamp < ?1",
            params![cutoff_ms],
        )?;
        if rows > 0 {
            debug!(rows, "Pruned access logs");
        }
        Ok(rows)
    }

    // ==================== Maintenance ====================

    /// Write a consistent copy of the registry to `dest`
    pub fn snapshot_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }

        let conn = self.conn()?;
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy().into_owned()])?;
        Ok(())
    }

    /// Fold the write-ahead log back into the main database file
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Checkpoint and close the connection. Callers still holding the
    /// registry get `RegistryError::Closed` from then on.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        conn.close().map_err(|(_, e)| RegistryError::Sqlite(e))?;
        info!("Registry closed");
        Ok(())
    }

    fn conn(&self) -> Result<MappedMutexGuard<'_, Connection>> {
        MutexGuard::try_map(self.conn.lock(), Option::as_mut).map_err(|_| RegistryError::Closed)
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        name: row.get(0)?,
        last_access_at: row.get(1)?,
        status: row.get(2)?,
    })
}

/// Migration v1: Initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        -- Project lifecycle state
        CREATE TABLE IF NOT EXISTS projects (
            name TEXT PRIMARY KEY,
            last_access_at INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'stopped'
        );

        -- Requests let through the front door
        CREATE TABLE IF NOT EXISTS access_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            client_ip TEXT NOT NULL DEFAULT '',
            user_agent TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_access_logs_project ON access_logs(project);
        CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp ON access_logs(timestamp);

        INSERT INTO schema_migrations (version) VALUES (1);
    "#,
    )?;

    Ok(())
}

/// Migration v2: index for the idle query
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: idle lookup index");

    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_projects_status_access ON projects(status, last_access_at);

        INSERT INTO schema_migrations (version) VALUES (2);
    "#,
    )?;

    Ok(())
}
