//! `Database` trait: single async interface for task persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::{StatusChange, Task, TaskPatch, TaskStatus};

/// Backend-agnostic task storage.
///
/// Every mutating call is committed before it returns. Status is only ever
/// written through [`Database::apply_status_change`], which is a
/// compare-and-set on the current status.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// All tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks with the given status, oldest first.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// Merge the plain fields of `patch` into the row. Status fields are ignored.
    /// Returns false if no row matched.
    async fn merge_task_fields(
        &self,
        id: Uuid,
        patch: &TaskPatch,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Apply `change` only if the stored status equals `change.from`.
    /// Returns true if exactly this caller's change was written.
    async fn apply_status_change(
        &self,
        id: Uuid,
        change: &StatusChange,
    ) -> Result<bool, DatabaseError>;

    /// Delete a task. Returns false if it did not exist.
    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Count tasks grouped by status.
    async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, DatabaseError>;
}
