//! Version-tracked database migrations for the libSQL backend.
//!
//! Each step has a version, a name and SQL. `run_migrations()` applies the
//! steps newer than the recorded version, in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                agent_type TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'todo',
                priority TEXT NOT NULL DEFAULT 'medium',
                blocked_reason TEXT,
                result TEXT,
                claimed_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "dispatch_order",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_dispatch
                ON tasks(status, priority, created_at);
        "#,
    },
];

/// Bring the schema up to the newest version.
///
/// Each pending step runs in its own transaction together with its
/// `_migrations` record, so a failed step leaves the previous version intact.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} ({}): {e}",
                migration.version, migration.name
            )));
        }
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("read version: {e}"))),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_schema() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for (kind, name) in [("table", "tasks"), ("table", "_migrations"), ("index", "idx_tasks_dispatch")] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type=?1 AND name=?2",
                    libsql::params![kind, name],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "{kind} '{name}' should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(applied_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut applied = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            applied.push((row.get::<i64>(0).unwrap(), row.get::<String>(1).unwrap()));
        }
        assert_eq!(
            applied,
            vec![(1, "task_queue".to_string()), (2, "dispatch_order".to_string())]
        );
    }
}
