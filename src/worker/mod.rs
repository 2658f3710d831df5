//! Worker execution engine.
//!
//! - `engine`: claim, execute, report; the polling loop
//! - `runner`: bounded subprocess with a hard timeout
//! - `prompt`: prompt construction for agent processes

pub mod engine;
pub mod prompt;
pub mod runner;

pub use engine::{WorkerConfig, WorkerEngine, spawn_worker_loop};
pub use runner::CommandSpec;
