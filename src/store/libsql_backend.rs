//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Status transitions are
//! single conditional `UPDATE` statements, so the compare-and-set holds
//! across connections and processes sharing the same file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{Priority, StatusChange, Task, TaskPatch, TaskStatus};

/// How long a writer waits on a locked database file before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

const TASK_COLUMNS: &str = "id, agent_name, agent_type, description, status, priority, \
     blocked_reason, result, claimed_by, created_at, updated_at, started_at, completed_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.configure().await?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// WAL + busy timeout so concurrent pollers wait instead of erroring.
    async fn configure(&self) -> Result<(), DatabaseError> {
        for pragma in [
            "PRAGMA journal_mode = WAL".to_string(),
            format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"),
        ] {
            // Both pragmas return a row, so go through query() not execute().
            let mut rows = self
                .conn()
                .query(&pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
            while let Ok(Some(_)) = rows.next().await {}
        }
        Ok(())
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{context} row: {e}"))),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width UTC so text order equals time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "unparseable timestamp '{s}'"
    )))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s))
        .transpose()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// Map a libsql Row to a Task. Column order matches `TASK_COLUMNS`.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;

    let agent_name: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.agent_name: {e}")))?;
    let agent_type: String = row.get(2).unwrap_or_default();
    let description: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("task.description: {e}")))?;

    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("task.status: {e}")))?;

    let priority_str: String = row.get(5).unwrap_or_else(|_| "medium".to_string());
    let priority: Priority = priority_str.parse().unwrap_or_default();

    let blocked_reason = non_empty(row.get(6).ok());
    let result: Option<String> = row.get(7).ok();
    let claimed_by = non_empty(row.get(8).ok());

    let created_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Query(format!("task.created_at: {e}")))?;
    let updated_str: String = row
        .get(10)
        .map_err(|e| DatabaseError::Query(format!("task.updated_at: {e}")))?;

    Ok(Task {
        id,
        agent_name,
        agent_type,
        description,
        status,
        priority,
        blocked_reason,
        result,
        claimed_by,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        started_at: parse_optional_datetime(row.get(11).ok())?,
        completed_at: parse_optional_datetime(row.get(12).ok())?,
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    task.id.to_string(),
                    task.agent_name.as_str(),
                    task.agent_type.as_str(),
                    task.description.as_str(),
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.blocked_reason.clone(),
                    task.result.clone(),
                    task.claimed_by.clone(),
                    format_datetime(&task.created_at),
                    format_datetime(&task.updated_at),
                    task.started_at.as_ref().map(format_datetime),
                    task.completed_at.as_ref().map(format_datetime),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(id = %task.id, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                "get_task",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, rowid ASC"),
            (),
            "list_tasks",
        )
        .await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![status.as_str()],
            "list_tasks_by_status",
        )
        .await
    }

    async fn merge_task_fields(
        &self,
        id: Uuid,
        patch: &TaskPatch,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    agent_name = COALESCE(?1, agent_name),
                    agent_type = COALESCE(?2, agent_type),
                    description = COALESCE(?3, description),
                    priority = COALESCE(?4, priority),
                    updated_at = MAX(updated_at, ?5)
                 WHERE id = ?6",
                params![
                    patch.agent_name.as_deref().map(str::trim),
                    patch.agent_type.as_deref().map(str::trim),
                    patch.description.clone(),
                    patch.priority.map(|p| p.as_str()),
                    format_datetime(&at),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("merge_task_fields: {e}")))?;
        Ok(count > 0)
    }

    async fn apply_status_change(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> Result<bool, DatabaseError> {
        // SET expressions all read the pre-update row, so started_at and
        // completed_at can never precede the previous updated_at.
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    status = ?1,
                    blocked_reason = ?2,
                    result = COALESCE(?3, result),
                    claimed_by = COALESCE(?4, claimed_by),
                    started_at = CASE WHEN ?1 = 'in_progress'
                        THEN COALESCE(started_at, MAX(updated_at, ?5))
                        ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('done', 'failed')
                        THEN MAX(updated_at, ?5)
                        ELSE completed_at END,
                    updated_at = MAX(updated_at, ?5)
                 WHERE id = ?6 AND status = ?7",
                params![
                    change.to.as_str(),
                    change.blocked_reason.clone(),
                    change.result.clone(),
                    change.claimed_by.clone(),
                    format_datetime(&change.at),
                    id.to_string(),
                    change.from.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_status_change: {e}")))?;
        debug!(id = %id, from = %change.from, to = %change.to, applied = count > 0, "Status change");
        Ok(count == 1)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(count > 0)
    }

    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count.status: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            if let Ok(status) = status_str.parse::<TaskStatus>() {
                counts.push((status, count.max(0) as u64));
            }
        }
        Ok(counts)
    }
}
