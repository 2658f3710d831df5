//! Task store: the only owner of task lifecycle mutation.
//!
//! Wraps a [`Database`] with the status machine, the atomic claim, the
//! blocked-observer fan-out and the live event feed. Reads hand out owned
//! copies; nothing outside this type writes a task back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::store::Database;
use crate::tasks::model::{
    NewTask, StatusChange, Task, TaskEvent, TaskPatch, TaskStats, TaskStatus, sort_for_dispatch,
};
use crate::tasks::observer::{BlockedObserver, ObserverRegistry};

/// Attempts at a status compare-and-set before giving up on a contended task.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Capacity of the live event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status fields carried by a single transition.
#[derive(Default)]
struct TransitionFields {
    blocked_reason: Option<String>,
    result: Option<String>,
    claimed_by: Option<String>,
}

/// Handle to the task collection. Cheap to clone.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<dyn Database>,
    observers: Arc<ObserverRegistry>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            observers: Arc::new(ObserverRegistry::new()),
            events,
        }
    }

    /// Add an observer for transitions into `blocked`.
    pub async fn register_observer(&self, observer: Arc<dyn BlockedObserver>) {
        self.observers.register(observer).await;
    }

    /// Subscribe to the live event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Create a new `todo` task.
    pub async fn create(&self, payload: NewTask) -> Result<Task, TaskError> {
        payload.validate()?;
        let task = Task::new(payload);
        self.db.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            agent = %task.agent_name,
            agent_type = %task.agent_type,
            priority = %task.priority,
            "Task created"
        );
        self.publish(TaskEvent::TaskCreated { task: task.clone() });
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, TaskError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Result<Vec<Task>, TaskError> {
        Ok(self.db.list_tasks().await?)
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskError> {
        Ok(self.db.list_tasks_by_status(status).await?)
    }

    /// Unclaimed tasks with an agent type, minus `exclusions`, in dispatch order.
    pub async fn claimable(&self, exclusions: &HashSet<Uuid>) -> Result<Vec<Task>, TaskError> {
        let mut tasks: Vec<Task> = self
            .db
            .list_tasks_by_status(TaskStatus::Todo)
            .await?
            .into_iter()
            .filter(|t| t.is_dispatchable() && !exclusions.contains(&t.id))
            .collect();
        sort_for_dispatch(&mut tasks);
        Ok(tasks)
    }

    /// Atomically take ownership of a `todo` task.
    ///
    /// Of any number of concurrent claims on the same task exactly one
    /// succeeds; the rest get `AlreadyClaimed`. Claiming a finished task is
    /// an `InvalidTransition`.
    pub async fn claim(&self, id: Uuid, claimant: &str) -> Result<Task, TaskError> {
        let claimant = claimant.trim();
        if claimant.is_empty() {
            return Err(TaskError::Validation("claimant must not be empty".into()));
        }

        let current = self.get(id).await?;
        match current.status {
            TaskStatus::Todo => {}
            status if status.is_terminal() => {
                return Err(TaskError::InvalidTransition {
                    id,
                    from: status,
                    to: TaskStatus::InProgress,
                });
            }
            status => return Err(TaskError::AlreadyClaimed { id, status }),
        }

        let change = StatusChange {
            from: TaskStatus::Todo,
            to: TaskStatus::InProgress,
            at: Utc::now(),
            blocked_reason: None,
            result: None,
            claimed_by: Some(claimant.to_string()),
        };
        if !self.db.apply_status_change(id, &change).await? {
            let status = self.get(id).await?.status;
            debug!(task_id = %id, claimant, %status, "Claim lost");
            return Err(TaskError::AlreadyClaimed { id, status });
        }

        let task = self.get(id).await?;
        info!(task_id = %id, claimant, "Task claimed");
        self.publish(TaskEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Human approval: `todo` or `blocked` to `in_progress`, clearing the reason.
    pub async fn approve(&self, id: Uuid) -> Result<Task, TaskError> {
        self.transition(id, TaskStatus::InProgress, TransitionFields::default())
            .await
    }

    /// Park a task until a human looks at it.
    pub async fn block(&self, id: Uuid, reason: &str) -> Result<Task, TaskError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(TaskError::Validation("block reason must not be empty".into()));
        }
        self.transition(
            id,
            TaskStatus::Blocked,
            TransitionFields {
                blocked_reason: Some(reason.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn complete(&self, id: Uuid, result: &str) -> Result<Task, TaskError> {
        self.transition(
            id,
            TaskStatus::Done,
            TransitionFields {
                result: Some(result.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<Task, TaskError> {
        self.transition(
            id,
            TaskStatus::Failed,
            TransitionFields {
                result: Some(error.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Merge plain fields; a `status` in the patch goes through the status machine.
    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Task, TaskError> {
        patch.validate()?;
        let current = self.get(id).await?;

        // Transition first so a rejected status leaves the fields untouched too.
        let mut task = match patch.status {
            Some(target) if target != current.status => {
                self.apply_patch_status(&current, target, &patch).await?
            }
            _ => current,
        };

        if patch.has_field_changes() {
            if !self.db.merge_task_fields(id, &patch, Utc::now()).await? {
                return Err(TaskError::NotFound { id });
            }
            task = self.get(id).await?;
            debug!(task_id = %id, "Task fields updated");
            self.publish(TaskEvent::TaskUpdated { task: task.clone() });
        }
        Ok(task)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), TaskError> {
        if !self.db.delete_task(id).await? {
            return Err(TaskError::NotFound { id });
        }
        info!(task_id = %id, "Task deleted");
        self.publish(TaskEvent::TaskDeleted { id });
        Ok(())
    }

    /// Per-status counts.
    pub async fn stats(&self) -> Result<TaskStats, TaskError> {
        let mut stats = TaskStats::default();
        for (status, count) in self.db.count_by_status().await? {
            stats.add(status, count);
        }
        Ok(stats)
    }

    /// Fail claimed `in_progress` tasks that have not changed for `older_than`.
    ///
    /// Recovers tasks whose poller died mid-run. Tasks moved to
    /// `in_progress` by a human approval have no claimant and are left alone.
    pub async fn fail_stale(&self, older_than: Duration) -> Result<Vec<Task>, TaskError> {
        let threshold = chrono::Duration::from_std(older_than)
            .map_err(|e| TaskError::Validation(format!("stale threshold out of range: {e}")))?;
        let cutoff = Utc::now() - threshold;

        let mut failed = Vec::new();
        for task in self.db.list_tasks_by_status(TaskStatus::InProgress).await? {
            if task.claimed_by.is_none() || task.updated_at >= cutoff {
                continue;
            }
            let error = format!(
                "abandoned: no result from {} after {}s",
                task.claimed_by.as_deref().unwrap_or("unknown"),
                older_than.as_secs()
            );
            match self.fail(task.id, &error).await {
                Ok(task) => {
                    warn!(task_id = %task.id, "Failed stale in-progress task");
                    failed.push(task);
                }
                // Finished or deleted between the scan and the write.
                Err(TaskError::InvalidTransition { .. } | TaskError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    async fn apply_patch_status(
        &self,
        current: &Task,
        target: TaskStatus,
        patch: &TaskPatch,
    ) -> Result<Task, TaskError> {
        match target {
            TaskStatus::Blocked => {
                let reason = patch.blocked_reason.as_deref().unwrap_or_default();
                self.block(current.id, reason).await
            }
            TaskStatus::InProgress => self.approve(current.id).await,
            TaskStatus::Done => {
                self.complete(current.id, patch.result.as_deref().unwrap_or_default())
                    .await
            }
            TaskStatus::Failed => {
                self.fail(current.id, patch.result.as_deref().unwrap_or_default())
                    .await
            }
            TaskStatus::Todo => Err(TaskError::InvalidTransition {
                id: current.id,
                from: current.status,
                to: target,
            }),
        }
    }

    /// Validate against the status machine, then compare-and-set.
    ///
    /// A lost race re-reads the task and re-validates, so a concurrent
    /// terminal write turns into `InvalidTransition` rather than an overwrite.
    async fn transition(
        &self,
        id: Uuid,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, TaskError> {
        let mut from = self.get(id).await?.status;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            if !from.can_transition_to(to) {
                return Err(TaskError::InvalidTransition { id, from, to });
            }

            let change = StatusChange {
                from,
                to,
                at: Utc::now(),
                blocked_reason: fields.blocked_reason.clone(),
                result: fields.result.clone(),
                claimed_by: fields.claimed_by.clone(),
            };
            if self.db.apply_status_change(id, &change).await? {
                let task = self.get(id).await?;
                info!(task_id = %id, %from, %to, "Task transitioned");
                self.publish(TaskEvent::TaskUpdated { task: task.clone() });
                if to == TaskStatus::Blocked {
                    self.observers.notify_blocked(&task).await;
                }
                return Ok(task);
            }

            debug!(task_id = %id, %from, %to, attempt, "Status changed underneath, retrying");
            from = self.get(id).await?.status;
        }
        Err(TaskError::InvalidTransition { id, from, to })
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
