//! Agent dispatch: persisted task queue, resource-aware admission and
//! bounded agent subprocess execution.

pub mod admission;
pub mod agents;
pub mod config;
pub mod error;
pub mod monitor;
pub mod store;
pub mod tasks;
pub mod worker;
