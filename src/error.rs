//! Error types for agent dispatch.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::TaskStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task store errors. Every variant leaves the task unchanged.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid task payload: {0}")]
    Validation(String),

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} was already claimed (status {status})")]
    AlreadyClaimed { id: Uuid, status: TaskStatus },

    #[error("Storage failure: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors from running an agent subprocess for a task.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("No agent profile configured for agent type '{agent_type}'")]
    ConfigMissing { agent_type: String },

    #[error("Agent process timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Agent process failed: {0}")]
    Subprocess(String),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource sampling errors.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Resource sampling failed: {0}")]
    SampleFailed(String),
}
