//! Task queue: model, lifecycle store, observers and the HTTP façade.

pub mod model;
pub mod observer;
pub mod routes;
pub mod store;

pub use model::{NewTask, Priority, Task, TaskEvent, TaskPatch, TaskStats, TaskStatus};
pub use observer::{BlockedObserver, LogObserver, ObserverRegistry, WebhookObserver};
pub use routes::{ApiState, task_routes};
pub use store::TaskStore;
