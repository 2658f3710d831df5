//! Worker execution engine: claims a task and runs its agent process.
//!
//! One task per cycle. Engines share nothing in memory; running several
//! against the same database is safe because only one claim can win.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{AgentProfile, AgentRegistry};
use crate::error::{ExecError, TaskError};
use crate::tasks::TaskStore;
use crate::tasks::model::Task;
use crate::worker::prompt::build_prompt;
use crate::worker::runner::{CommandSpec, run_agent_command};

/// Headroom between the longest agent timeout and the stale sweep.
const STALE_MARGIN: Duration = Duration::from_secs(60);

/// Engine settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded as `claimedBy` on every task this engine claims.
    pub worker_id: String,
    /// Used when the agent profile has no command of its own.
    pub default_command: CommandSpec,
    pub default_timeout: Duration,
    pub prompt_max_chars: usize,
    /// Claimed tasks untouched for this long are failed as abandoned.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            default_command: CommandSpec::new("claude", vec!["-p".into()]),
            default_timeout: Duration::from_secs(300),
            prompt_max_chars: 4000,
            stale_after: Duration::from_secs(3600),
        }
    }
}

pub struct WorkerEngine {
    store: TaskStore,
    agents: Arc<AgentRegistry>,
    config: WorkerConfig,
}

impl WorkerEngine {
    pub fn new(store: TaskStore, agents: Arc<AgentRegistry>, config: WorkerConfig) -> Self {
        Self {
            store,
            agents,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Age after which a claimed task counts as abandoned.
    ///
    /// Never shorter than the longest timeout a live agent process may run
    /// under, plus [`STALE_MARGIN`].
    pub fn stale_threshold(&self) -> Duration {
        let longest = self
            .agents
            .longest_timeout()
            .map_or(self.config.default_timeout, |t| t.max(self.config.default_timeout));
        self.config.stale_after.max(longest + STALE_MARGIN)
    }

    /// Fail claimed tasks whose poller went away.
    pub async fn recover_stale(&self) -> Result<Vec<Task>, TaskError> {
        self.store.fail_stale(self.stale_threshold()).await
    }

    /// Claim the best claimable task that has an agent profile.
    ///
    /// Tasks without a profile stay `todo`. Losing a claim race moves on to
    /// the next candidate.
    pub async fn claim_next(&self, exclusions: &HashSet<Uuid>) -> Result<Option<Task>, TaskError> {
        for candidate in self.store.claimable(exclusions).await? {
            if self.agents.get(&candidate.agent_type).is_none() {
                let e = ExecError::ConfigMissing {
                    agent_type: candidate.agent_type.clone(),
                };
                warn!(task_id = %candidate.id, error = %e, "Skipping task");
                continue;
            }

            match self.store.claim(candidate.id, &self.config.worker_id).await {
                Ok(task) => return Ok(Some(task)),
                Err(
                    TaskError::AlreadyClaimed { .. }
                    | TaskError::InvalidTransition { .. }
                    | TaskError::NotFound { .. },
                ) => {
                    debug!(task_id = %candidate.id, "Candidate taken by another poller");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Run the agent process for a claimed task and record the outcome.
    pub async fn execute(&self, task: Task) -> Result<Task, TaskError> {
        let Some(profile) = self.agents.get(&task.agent_type) else {
            let e = ExecError::ConfigMissing {
                agent_type: task.agent_type.clone(),
            };
            return self.store.fail(task.id, &e.to_string()).await;
        };

        let (command, timeout) = self.invocation(profile);
        let prompt = build_prompt(profile, &task, self.config.prompt_max_chars);
        info!(
            task_id = %task.id,
            agent_type = %task.agent_type,
            command = %command,
            timeout_secs = timeout.as_secs(),
            "Running agent process"
        );

        let started = std::time::Instant::now();
        match run_agent_command(&command, &prompt, timeout).await {
            Ok(output) => {
                info!(
                    task_id = %task.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    output_len = output.len(),
                    "Agent process completed"
                );
                self.store.complete(task.id, &output).await
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Agent process failed");
                self.store.fail(task.id, &e.to_string()).await
            }
        }
    }

    /// Claim one task and execute it. `None` when nothing was claimable.
    pub async fn run_cycle(&self, exclusions: &HashSet<Uuid>) -> Result<Option<Task>, TaskError> {
        match self.claim_next(exclusions).await? {
            Some(task) => self.execute(task).await.map(Some),
            None => Ok(None),
        }
    }

    fn invocation(&self, profile: &AgentProfile) -> (CommandSpec, Duration) {
        let command = profile
            .command
            .as_deref()
            .and_then(CommandSpec::from_argv)
            .unwrap_or_else(|| self.config.default_command.clone());
        let timeout = profile.timeout().unwrap_or(self.config.default_timeout);
        (command, timeout)
    }
}

/// Spawn the worker polling loop.
///
/// Each tick:
/// 1. Fail claimed tasks that went stale (crash recovery)
/// 2. Claim and run at most one task
pub fn spawn_worker_loop(
    engine: Arc<WorkerEngine>,
    interval: Duration,
    exclusions: Arc<HashSet<Uuid>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            worker_id = engine.worker_id(),
            interval_secs = interval.as_secs(),
            stale_after_secs = engine.stale_threshold().as_secs(),
            "Worker loop started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            // Phase 1: stale recovery
            match engine.recover_stale().await {
                Ok(failed) if !failed.is_empty() => {
                    info!(count = failed.len(), "Failed abandoned tasks");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Stale task sweep failed"),
            }

            // Phase 2: one task
            match engine.run_cycle(&exclusions).await {
                Ok(Some(task)) => {
                    info!(task_id = %task.id, status = %task.status, "Worker cycle finished");
                }
                Ok(None) => debug!("No claimable tasks"),
                Err(e) => error!(error = %e, "Worker cycle failed"),
            }
        }
    })
}
