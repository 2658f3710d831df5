//! Task data model: status machine, priorities, payloads, and event types.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Maximum accepted description length (characters).
pub const MAX_DESCRIPTION_CHARS: usize = 20_000;

/// Maximum accepted agent name / type length (characters).
pub const MAX_AGENT_FIELD_CHARS: usize = 128;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Todo,
    /// Owned by a worker or approved by a human.
    InProgress,
    /// Waiting on a human; carries a reason.
    Blocked,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// All statuses in board order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Todo, InProgress)
                | (Todo, Blocked)
                | (InProgress, Blocked)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (Blocked, InProgress)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Storage / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TaskError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Task priority. Declaration order is ascending urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(TaskError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// A unit of dispatchable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique ID, immutable for the lifetime of the store.
    pub id: Uuid,
    /// Display name of the agent persona.
    pub agent_name: String,
    /// Selects the execution profile. Empty means "not dispatchable".
    #[serde(default)]
    pub agent_type: String,
    /// Free-text work item.
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Present only while blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    /// Output on success, error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Poller identity that claimed the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh `todo` task from a validated payload.
    pub fn new(payload: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_name: payload.agent_name.trim().to_string(),
            agent_type: payload.agent_type.trim().to_string(),
            description: payload.description,
            status: TaskStatus::Todo,
            priority: payload.priority.unwrap_or_default(),
            blocked_reason: None,
            result: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether a poller may pick this task up.
    pub fn is_dispatchable(&self) -> bool {
        self.status == TaskStatus::Todo && !self.agent_type.trim().is_empty()
    }
}

/// Dispatch order: higher priority first, then oldest first.
pub fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Sort tasks in place into dispatch order (stable).
pub fn sort_for_dispatch(tasks: &mut [Task]) {
    tasks.sort_by(dispatch_order);
}

/// Payload for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub agent_name: String,
    #[serde(default)]
    pub agent_type: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl NewTask {
    pub fn new(
        agent_name: impl Into<String>,
        agent_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            description: description.into(),
            priority: None,
        }
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Reject malformed payloads before anything is persisted.
    pub fn validate(&self) -> Result<(), TaskError> {
        validate_agent_field("agentName", &self.agent_name, true)?;
        validate_agent_field("agentType", &self.agent_type, false)?;
        validate_description(&self.description)
    }
}

/// Generic field merge. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Routed through the status machine, never written directly.
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Required when `status` is `blocked`.
    #[serde(default)]
    pub blocked_reason: Option<String>,
    /// Used when `status` is `done` or `failed`.
    #[serde(default)]
    pub result: Option<String>,
}

impl TaskPatch {
    /// True when the patch touches a plain (non-status) field.
    pub fn has_field_changes(&self) -> bool {
        self.agent_name.is_some()
            || self.agent_type.is_some()
            || self.description.is_some()
            || self.priority.is_some()
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if let Some(ref name) = self.agent_name {
            validate_agent_field("agentName", name, true)?;
        }
        if let Some(ref agent_type) = self.agent_type {
            validate_agent_field("agentType", agent_type, false)?;
        }
        if let Some(ref desc) = self.description {
            validate_description(desc)?;
        }
        Ok(())
    }
}

fn validate_agent_field(key: &str, value: &str, required: bool) -> Result<(), TaskError> {
    if required && value.trim().is_empty() {
        return Err(TaskError::Validation(format!("{key} must not be empty")));
    }
    if value.chars().count() > MAX_AGENT_FIELD_CHARS {
        return Err(TaskError::Validation(format!(
            "{key} exceeds {MAX_AGENT_FIELD_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_description(desc: &str) -> Result<(), TaskError> {
    if desc.trim().is_empty() {
        return Err(TaskError::Validation("description must not be empty".into()));
    }
    if desc.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(TaskError::Validation(format!(
            "description exceeds {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok(())
}

/// A compare-and-set status change as persisted by the store backend.
///
/// Applies only if the stored status still equals `from`.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    /// Written verbatim; `None` clears the column.
    pub blocked_reason: Option<String>,
    /// Written only when `Some`.
    pub result: Option<String>,
    /// Written only when `Some`.
    pub claimed_by: Option<String>,
}

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub todo: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub done: u64,
    pub failed: u64,
    pub total: u64,
}

impl TaskStats {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Todo => self.todo += count,
            TaskStatus::InProgress => self.in_progress += count,
            TaskStatus::Blocked => self.blocked += count,
            TaskStatus::Done => self.done += count,
            TaskStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

/// Messages pushed to live dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Full snapshot (sent on connect and after lag).
    TasksSync { tasks: Vec<Task> },
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskDeleted { id: Uuid },
}
