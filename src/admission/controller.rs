//! Admission controller: gates new work on live resource pressure.
//!
//! Each tick samples the host, refuses to start anything while any
//! dimension is at its ceiling or the in-flight count is at its limit, and
//! otherwise claims the top claimable task and runs it on a background
//! task through the worker engine. It never preempts running work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::policy::{Ceilings, Pressure};
use crate::error::TaskError;
use crate::monitor::{LatestSample, ResourceMonitor};
use crate::worker::WorkerEngine;

/// Controller settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub ceilings: Ceilings,
    pub max_concurrent: usize,
    /// Task ids never dispatched automatically.
    pub exclusions: HashSet<Uuid>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            ceilings: Ceilings::default(),
            max_concurrent: 3,
            exclusions: HashSet::new(),
        }
    }
}

/// A task the controller started and is still running.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightWorker {
    pub task_id: Uuid,
    pub agent_name: String,
    pub agent_type: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Sampling failed; the cycle was skipped.
    SampleUnavailable,
    Pressure(Pressure),
    AtCapacity { in_flight: usize },
    /// Nothing claimable.
    Idle,
    Dispatched { task_id: Uuid },
}

pub struct AdmissionController {
    monitor: Arc<dyn ResourceMonitor>,
    engine: Arc<WorkerEngine>,
    latest: LatestSample,
    config: AdmissionConfig,
    in_flight: Arc<RwLock<HashMap<Uuid, InFlightWorker>>>,
    /// Slots taken by ticks that are still claiming. Only changed while the
    /// `in_flight` write lock is held.
    reserved: AtomicUsize,
}

impl AdmissionController {
    pub fn new(
        monitor: Arc<dyn ResourceMonitor>,
        engine: Arc<WorkerEngine>,
        latest: LatestSample,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            monitor,
            engine,
            latest,
            config,
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            reserved: AtomicUsize::new(0),
        }
    }

    /// Snapshot of running workers, oldest first.
    pub async fn in_flight(&self) -> Vec<InFlightWorker> {
        let mut workers: Vec<InFlightWorker> =
            self.in_flight.read().await.values().cloned().collect();
        workers.sort_by_key(|w| w.started_at);
        workers
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Run one admission cycle.
    ///
    /// No lock is held while sampling or claiming; a capacity slot is
    /// reserved up front and turned into an in-flight entry or released.
    pub async fn tick(&self) -> Result<AdmissionDecision, TaskError> {
        let sample = match self.monitor.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Resource sample failed, skipping admission cycle");
                return Ok(AdmissionDecision::SampleUnavailable);
            }
        };
        self.latest.set(sample).await;

        if let Some(pressure) = self.config.ceilings.exceeded(&sample) {
            debug!(
                dimension = %pressure.dimension,
                value = pressure.value,
                ceiling = pressure.ceiling,
                "Resource pressure, not admitting"
            );
            return Ok(AdmissionDecision::Pressure(pressure));
        }

        let occupied = {
            let registry = self.in_flight.write().await;
            let occupied = registry.len() + self.reserved.load(Ordering::SeqCst);
            if occupied >= self.config.max_concurrent {
                debug!(in_flight = occupied, max = self.config.max_concurrent, "At capacity");
                return Ok(AdmissionDecision::AtCapacity { in_flight: occupied });
            }
            self.reserved.fetch_add(1, Ordering::SeqCst);
            occupied
        };

        let claimed = self.engine.claim_next(&self.config.exclusions).await;
        let task = {
            let mut registry = self.in_flight.write().await;
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            match claimed {
                Ok(Some(task)) => {
                    registry.insert(
                        task.id,
                        InFlightWorker {
                            task_id: task.id,
                            agent_name: task.agent_name.clone(),
                            agent_type: task.agent_type.clone(),
                            worker_id: self.engine.worker_id().to_string(),
                            started_at: Utc::now(),
                        },
                    );
                    task
                }
                Ok(None) => return Ok(AdmissionDecision::Idle),
                Err(e) => return Err(e),
            }
        };

        let task_id = task.id;
        info!(
            task_id = %task_id,
            in_flight = occupied + 1,
            cpu = sample.cpu_percent,
            ram = sample.ram_percent,
            disk = sample.disk_percent,
            "Admitted task"
        );

        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            match engine.execute(task).await {
                Ok(task) => info!(task_id = %task.id, status = %task.status, "Admitted task finished"),
                Err(e) => warn!(task_id = %task_id, error = %e, "Admitted task could not be recorded"),
            }
            registry.write().await.remove(&task_id);
        });

        Ok(AdmissionDecision::Dispatched { task_id })
    }
}

/// Spawn the admission loop.
pub fn spawn_admission_loop(
    controller: Arc<AdmissionController>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_concurrent = controller.max_concurrent(),
            "Admission loop started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Err(e) = controller.tick().await {
                error!(error = %e, "Admission cycle failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, AgentRegistry};
    use crate::error::MonitorError;
    use crate::monitor::ResourceSample;
    use crate::store::LibSqlBackend;
    use crate::tasks::TaskStore;
    use crate::tasks::model::{NewTask, Priority, Task, TaskStatus};
    use crate::worker::{CommandSpec, WorkerConfig};
    use async_trait::async_trait;

    struct FixedMonitor(ResourceSample);

    #[async_trait]
    impl ResourceMonitor for FixedMonitor {
        async fn sample(&self) -> Result<ResourceSample, MonitorError> {
            Ok(self.0)
        }
    }

    struct BrokenMonitor;

    #[async_trait]
    impl ResourceMonitor for BrokenMonitor {
        async fn sample(&self) -> Result<ResourceSample, MonitorError> {
            Err(MonitorError::SampleFailed("no /proc".into()))
        }
    }

    fn calm() -> ResourceSample {
        ResourceSample::new(10.0, 20.0, 30.0)
    }

    async fn setup(
        monitor: Arc<dyn ResourceMonitor>,
        script: &str,
        config: AdmissionConfig,
    ) -> (AdmissionController, TaskStore, LatestSample) {
        let store = TaskStore::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()));
        let agents = AgentRegistry::from_profiles(vec![AgentProfile::new("editor", "Gianni")
            .with_command(vec!["sh".into(), "-c".into(), script.into()])])
        .unwrap();
        let engine = WorkerEngine::new(
            store.clone(),
            Arc::new(agents),
            WorkerConfig {
                worker_id: "admission-test".into(),
                default_command: CommandSpec::new("cat", vec![]),
                default_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let latest = LatestSample::new();
        let controller =
            AdmissionController::new(monitor, Arc::new(engine), latest.clone(), config);
        (controller, store, latest)
    }

    async fn add(store: &TaskStore, priority: Priority) -> Task {
        store
            .create(NewTask::new("gianni", "editor", "Write the intro").with_priority(priority))
            .await
            .unwrap()
    }

    async fn wait_idle(controller: &AdmissionController) {
        for _ in 0..200 {
            if controller.in_flight_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("admitted work never finished");
    }

    #[tokio::test]
    async fn pressure_means_zero_claims() {
        for sample in [
            ResourceSample::new(85.0, 10.0, 10.0),
            ResourceSample::new(10.0, 99.0, 10.0),
            ResourceSample::new(10.0, 10.0, 90.0),
        ] {
            let (controller, store, latest) =
                setup(Arc::new(FixedMonitor(sample)), "echo ok", AdmissionConfig::default()).await;
            let task = add(&store, Priority::High).await;

            let decision = controller.tick().await.unwrap();
            assert!(matches!(decision, AdmissionDecision::Pressure(_)), "{decision:?}");
            assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Todo);
            assert!(latest.get().await.is_some());
        }
    }

    #[tokio::test]
    async fn failed_sample_skips_cycle() {
        let (controller, store, latest) =
            setup(Arc::new(BrokenMonitor), "echo ok", AdmissionConfig::default()).await;
        let task = add(&store, Priority::High).await;

        assert_eq!(
            controller.tick().await.unwrap(),
            AdmissionDecision::SampleUnavailable
        );
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Todo);
        assert!(latest.get().await.is_none());
    }

    #[tokio::test]
    async fn dispatches_top_task_and_runs_it() {
        let (controller, store, _) =
            setup(Arc::new(FixedMonitor(calm())), "echo written", AdmissionConfig::default()).await;
        add(&store, Priority::Low).await;
        let high = add(&store, Priority::High).await;

        let decision = controller.tick().await.unwrap();
        assert_eq!(decision, AdmissionDecision::Dispatched { task_id: high.id });

        wait_idle(&controller).await;
        let done = store.get(high.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result.as_deref(), Some("written"));
    }

    #[tokio::test]
    async fn capacity_limits_in_flight_work() {
        let config = AdmissionConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let (controller, store, _) =
            setup(Arc::new(FixedMonitor(calm())), "sleep 2; echo late", config).await;
        let first = add(&store, Priority::High).await;
        let second = add(&store, Priority::Medium).await;

        assert!(matches!(
            controller.tick().await.unwrap(),
            AdmissionDecision::Dispatched { task_id } if task_id == first.id
        ));
        assert_eq!(
            controller.tick().await.unwrap(),
            AdmissionDecision::AtCapacity { in_flight: 1 }
        );
        assert_eq!(store.get(second.id).await.unwrap().status, TaskStatus::Todo);

        let workers = controller.in_flight().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].task_id, first.id);
    }

    #[tokio::test]
    async fn excluded_tasks_are_not_dispatched() {
        let store = TaskStore::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()));
        let task = add(&store, Priority::High).await;

        let agents = AgentRegistry::from_profiles(vec![AgentProfile::new("editor", "Gianni")]).unwrap();
        let engine = WorkerEngine::new(store.clone(), Arc::new(agents), WorkerConfig::default());
        let controller = AdmissionController::new(
            Arc::new(FixedMonitor(calm())),
            Arc::new(engine),
            LatestSample::new(),
            AdmissionConfig {
                exclusions: HashSet::from([task.id]),
                ..Default::default()
            },
        );

        assert_eq!(controller.tick().await.unwrap(), AdmissionDecision::Idle);
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn overlapping_ticks_share_the_capacity() {
        let config = AdmissionConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let (controller, store, _) =
            setup(Arc::new(FixedMonitor(calm())), "sleep 2; echo late", config).await;
        add(&store, Priority::High).await;
        add(&store, Priority::High).await;

        let (a, b) = tokio::join!(controller.tick(), controller.tick());
        let decisions = [a.unwrap(), b.unwrap()];
        let dispatched = decisions
            .iter()
            .filter(|d| matches!(d, AdmissionDecision::Dispatched { .. }))
            .count();
        assert_eq!(dispatched, 1, "{decisions:?}");
        assert_eq!(controller.in_flight_count().await, 1);
        assert_eq!(store.list_by_status(TaskStatus::Todo).await.unwrap().len(), 1);
    }
}
