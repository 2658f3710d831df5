//! Blocked-task observers.
//!
//! Every transition into `blocked` is fanned out to the registered
//! observers on background tasks. Observer failures are logged and never
//! reach the caller that blocked the task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::tasks::model::Task;

/// Something that wants to hear about tasks waiting on a human.
#[async_trait]
pub trait BlockedObserver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once per transition into `blocked`.
    async fn on_blocked(&self, task: &Task) -> anyhow::Result<()>;
}

/// Registry of blocked-task observers.
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn BlockedObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer.
    pub async fn register(&self, observer: Arc<dyn BlockedObserver>) {
        debug!(observer = observer.name(), "Registered blocked observer");
        self.observers.write().await.push(observer);
    }

    pub async fn len(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.read().await.is_empty()
    }

    /// Fire-and-forget: each observer runs on its own task.
    pub async fn notify_blocked(&self, task: &Task) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            let task = task.clone();
            tokio::spawn(async move {
                if let Err(e) = observer.on_blocked(&task).await {
                    warn!(
                        observer = observer.name(),
                        task_id = %task.id,
                        error = %e,
                        "Blocked observer failed"
                    );
                }
            });
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every blocked task at info level.
pub struct LogObserver;

#[async_trait]
impl BlockedObserver for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_blocked(&self, task: &Task) -> anyhow::Result<()> {
        info!(
            task_id = %task.id,
            agent = %task.agent_name,
            reason = task.blocked_reason.as_deref().unwrap_or(""),
            "Task blocked, waiting for a human"
        );
        Ok(())
    }
}

/// POSTs `{"event": "task_blocked", "task": {...}}` to a fixed URL.
pub struct WebhookObserver {
    client: reqwest::Client,
    url: String,
}

impl WebhookObserver {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl BlockedObserver for WebhookObserver {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn on_blocked(&self, task: &Task) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({
                "event": "task_blocked",
                "task": task,
            }))
            .send()
            .await?
            .error_for_status()?;
        debug!(task_id = %task.id, url = %self.url, "Blocked webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::NewTask;
    use tokio::sync::mpsc;

    struct ChannelObserver(mpsc::UnboundedSender<uuid::Uuid>);

    #[async_trait]
    impl BlockedObserver for ChannelObserver {
        fn name(&self) -> &str {
            "channel"
        }

        async fn on_blocked(&self, task: &Task) -> anyhow::Result<()> {
            self.0.send(task.id)?;
            Ok(())
        }
    }

    struct FailingObserver;

    #[async_trait]
    impl BlockedObserver for FailingObserver {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_blocked(&self, _task: &Task) -> anyhow::Result<()> {
            anyhow::bail!("observer exploded")
        }
    }

    #[tokio::test]
    async fn failing_observer_does_not_stop_others() {
        let registry = ObserverRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(Arc::new(FailingObserver)).await;
        registry.register(Arc::new(ChannelObserver(tx))).await;
        assert_eq!(registry.len().await, 2);

        let task = Task::new(NewTask::new("Pina", "illustrator", "Draw cover"));
        registry.notify_blocked(&task).await;

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, task.id);
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let registry = ObserverRegistry::default();
        assert!(registry.is_empty().await);
        let task = Task::new(NewTask::new("Pina", "illustrator", "Draw cover"));
        registry.notify_blocked(&task).await;
    }

    #[tokio::test]
    async fn webhook_to_unreachable_host_errors() {
        let observer = WebhookObserver::new("http://127.0.0.1:9/hook").unwrap();
        let task = Task::new(NewTask::new("Pina", "illustrator", "Draw cover"));
        assert!(observer.on_blocked(&task).await.is_err());
    }
}
