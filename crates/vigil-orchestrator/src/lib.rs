//! vigil-orchestrator: owns the lifecycle of every unit of sub-agent work.
//!
//! Tasks are created here (ad-hoc spawns and scheduler fires), executed by
//! the `Executor` collaborator, and funneled into the result bus exactly
//! once. Isolated tasks run fully in parallel; session-mode tasks for the
//! same session are serialized. Terminal state is a single-assignment cell:
//! whichever of {result, failure, cancellation} reports first wins, and any
//! later report is logged as an anomaly and dropped.

pub mod executor;
mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_bus::{DeliveredResult, Destination, ResultBus};
use vigil_scheduler::FireEvent;
use vigil_store::JobStore;
use vigil_types::{ExecutionMode, TaskOutcome, TaskState, TaskStatus};

pub use executor::{ExecError, ExecSpec, Executor};
use task::TaskSlot;

/// Longest run-summary carried forward for rolling continuity.
const ROLLING_SUMMARY_MAX_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid task spec: {0}")]
    InvalidSpec(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

/// A request to run one task.
pub struct TaskSpec {
    pub message: String,
    pub mode: ExecutionMode,
    /// Target session for delivery; required in session mode.
    pub session_id: Option<String>,
    /// Back-reference for job-triggered tasks; None for ad-hoc spawns.
    pub source_job_id: Option<String>,
    /// Per-task deadline; the orchestrator default applies if unset.
    pub deadline: Option<Duration>,
    /// Direct caller sink for ad-hoc isolated spawns without a session.
    pub reply: Option<oneshot::Sender<DeliveredResult>>,
}

/// Task lifecycle owner.
pub struct Orchestrator {
    store: Arc<JobStore>,
    bus: Arc<ResultBus>,
    executor: Arc<dyn Executor>,
    default_deadline: Duration,
    tasks: std::sync::Mutex<HashMap<String, Arc<TaskSlot>>>,
    /// Per-session execution locks for session-mode serialization.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<JobStore>,
        bus: Arc<ResultBus>,
        executor: Arc<dyn Executor>,
        default_deadline: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            executor,
            default_deadline,
            tasks: std::sync::Mutex::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a spec and launch its task. Returns immediately with the
    /// task id; execution proceeds in the background.
    pub fn spawn(self: &Arc<Self>, mut spec: TaskSpec) -> Result<String, OrchestratorError> {
        if spec.message.trim().is_empty() {
            return Err(OrchestratorError::InvalidSpec("message is empty".into()));
        }
        match spec.mode {
            ExecutionMode::Session if spec.session_id.is_none() => {
                return Err(OrchestratorError::InvalidSpec(
                    "session mode requires a session id".into(),
                ));
            }
            ExecutionMode::Isolated if spec.session_id.is_none() && spec.reply.is_none() => {
                return Err(OrchestratorError::InvalidSpec(
                    "isolated spawn needs a target session or a direct caller".into(),
                ));
            }
            _ => {}
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let destination = match spec.reply.take() {
            Some(tx) => Destination::Caller(tx),
            // Validated above for both modes.
            None if spec.mode == ExecutionMode::Session => Destination::Turn {
                session_id: spec.session_id.clone().unwrap_or_default(),
            },
            None => Destination::Session {
                session_id: spec.session_id.clone().unwrap_or_default(),
            },
        };

        let status = TaskStatus {
            task_id: task_id.clone(),
            source_job_id: spec.source_job_id.clone(),
            mode: spec.mode,
            session_id: spec.session_id.clone(),
            state: TaskState::Pending,
            started_at: None,
            ended_at: None,
            outcome: None,
            error: None,
        };
        let slot = Arc::new(TaskSlot::new(status, destination));
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id.clone(), slot.clone());

        let exec = ExecSpec {
            task_id: task_id.clone(),
            source_job_id: spec.source_job_id,
            mode: spec.mode,
            session_id: spec.session_id,
            message: spec.message,
            rolling_history_ref: None,
            deadline: spec.deadline.unwrap_or(self.default_deadline),
        };

        info!(task_id, mode = %exec.mode, "Task spawned");
        let this = self.clone();
        tokio::spawn(async move {
            this.run_task(slot, exec).await;
        });

        Ok(task_id)
    }

    /// Drive one task to its terminal state.
    async fn run_task(self: Arc<Self>, slot: Arc<TaskSlot>, mut exec: ExecSpec) {
        let task_id = exec.task_id.clone();

        // Session-mode tasks for the same session never overlap: the
        // execution lock is held for the whole run. Waiting counts as
        // Pending and can be cancelled.
        let _session_guard = if exec.mode == ExecutionMode::Session {
            let session_id = exec.session_id.clone().unwrap_or_default();
            let lock = self.session_exec_lock(&session_id).await;
            tokio::select! {
                _ = slot.cancel.cancelled() => {
                    self.on_terminal(&task_id, Err(ExecError::Cancelled)).await;
                    return;
                }
                guard = lock.lock_owned() => Some(guard),
            }
        } else {
            None
        };

        // A session-mode execution is the session's live turn: injections
        // from other tasks queue until it ends.
        let turn_session = match exec.mode {
            ExecutionMode::Session => exec.session_id.clone(),
            ExecutionMode::Isolated => None,
        };
        if let Some(session_id) = &turn_session {
            self.bus.registry().mark_live(session_id).await;
        }

        slot.mark_running();
        exec.rolling_history_ref = self.rolling_ref_for(&exec).await;

        // The deadline bounds even an executor that never checks its
        // cancellation token; cancellation itself stays cooperative.
        let result = match tokio::time::timeout(
            exec.deadline,
            self.executor.execute(&exec, slot.cancel.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecError::Failed(format!(
                "deadline of {:?} exceeded",
                exec.deadline
            ))),
        };

        self.on_terminal(&task_id, result).await;

        // Turn boundary: the turn's own delivery has landed, queued
        // injections for this session may now proceed.
        if let Some(session_id) = &turn_session {
            self.bus.registry().mark_idle(session_id).await;
        }
    }

    /// Sole writer of terminal state. Exactly one call per task takes
    /// effect; duplicates are logged and dropped so a result can never be
    /// delivered twice.
    pub async fn on_terminal(&self, task_id: &str, result: Result<TaskOutcome, ExecError>) {
        let slot = {
            let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.get(task_id).cloned()
        };
        let Some(slot) = slot else {
            warn!(task_id, "Terminal report for unknown task, ignoring");
            return;
        };

        let (state, outcome, error, delivered) = match result {
            Ok(TaskOutcome::Report { content }) => (
                TaskState::Delivered,
                Some(TaskOutcome::Report {
                    content: content.clone(),
                }),
                None,
                Some(DeliveredResult::Report(content)),
            ),
            Ok(TaskOutcome::Quiet) => (
                TaskState::Delivered,
                Some(TaskOutcome::Quiet),
                None,
                Some(DeliveredResult::Quiet),
            ),
            Err(ExecError::Cancelled) => (TaskState::Cancelled, None, None, None),
            Err(ExecError::Failed(reason)) => (
                TaskState::Failed,
                None,
                Some(reason.clone()),
                Some(DeliveredResult::Failure(reason)),
            ),
        };

        if !slot.try_finish(state, outcome.clone(), error) {
            warn!(task_id, "Delivery anomaly: duplicate terminal report ignored");
            return;
        }
        info!(task_id, state = %state, "Task reached terminal state");

        // Rolling continuity: remember what was reported before delivery
        // consumes the content.
        if let Some(TaskOutcome::Report { content }) = &outcome {
            self.record_rolling_summary(&slot.snapshot(), content).await;
        }

        let Some(destination) = slot.take_destination() else {
            warn!(task_id, "Task has no destination left, dropping result");
            return;
        };
        match delivered {
            Some(delivered) => {
                if let Err(e) = self.bus.deliver(task_id, delivered, destination).await {
                    warn!(task_id, "Result delivery failed: {e}");
                }
            }
            // Cancelled: nothing to deliver; dropping a caller destination
            // closes their channel.
            None => drop(destination),
        }
    }

    /// Request cooperative cancellation. Returns false (without signalling)
    /// when the task is already terminal.
    pub fn cancel(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        let slot = {
            let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.get(task_id).cloned()
        };
        let slot = slot.ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if slot.is_terminal() {
            return Ok(false);
        }
        info!(task_id, "Cancellation requested");
        slot.cancel.cancel();
        Ok(true)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.get(task_id).map(|s| s.snapshot())
    }

    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.values().map(|s| s.snapshot()).collect()
    }

    pub fn running_count(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks
            .values()
            .filter(|s| s.snapshot().state == TaskState::Running)
            .count()
    }

    /// Drop a finished task from tracking. Running tasks must be cancelled
    /// first.
    pub fn dismiss(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        let slot = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if !slot.is_terminal() {
            return Err(OrchestratorError::InvalidSpec(
                "cannot dismiss a task that is still running".into(),
            ));
        }
        tasks.remove(task_id);
        Ok(())
    }

    /// Turn a scheduler fire into a task.
    pub fn handle_fire(self: &Arc<Self>, event: FireEvent) {
        let job = event.job;
        let spec = TaskSpec {
            message: job.message.clone(),
            mode: job.mode,
            session_id: job.session_id.clone(),
            source_job_id: Some(job.id.clone()),
            deadline: None,
            reply: None,
        };
        match self.spawn(spec) {
            Ok(task_id) => info!(job_id = %job.id, task_id, "Fire dispatched"),
            Err(e) => warn!(job_id = %job.id, "Fire produced no task: {e}"),
        }
    }

    /// Consume fire events until the channel closes or shutdown is
    /// requested.
    pub async fn run_fire_loop(
        self: Arc<Self>,
        mut fire_rx: mpsc::UnboundedReceiver<FireEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Orchestrator fire loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Orchestrator fire loop stopped");
                    return;
                }
                event = fire_rx.recv() => match event {
                    Some(event) => self.handle_fire(event),
                    None => {
                        info!("Fire channel closed, orchestrator fire loop exiting");
                        return;
                    }
                },
            }
        }
    }

    async fn session_exec_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Prior-run summary for recurring isolated checks: the job's last run
    /// history entry, falling back to the session's rolling token for
    /// ad-hoc spawns.
    async fn rolling_ref_for(&self, exec: &ExecSpec) -> Option<String> {
        if let Some(job_id) = &exec.source_job_id {
            match self.store.last_run_summary(job_id).await {
                Ok(summary) => return summary,
                Err(e) => {
                    warn!(task_id = %exec.task_id, "Failed to load run history: {e}");
                    return None;
                }
            }
        }
        match &exec.session_id {
            Some(session_id) => self.bus.registry().rolling_ref(session_id).await,
            None => None,
        }
    }

    async fn record_rolling_summary(&self, status: &TaskStatus, content: &str) {
        let summary = truncate_chars(content, ROLLING_SUMMARY_MAX_CHARS);
        if let Some(job_id) = &status.source_job_id {
            if let Err(e) = self.store.append_run(job_id, summary).await {
                warn!(task_id = %status.task_id, "Failed to append run history: {e}");
            }
        }
        if let Some(session_id) = &status.session_id {
            self.bus.registry().set_rolling_ref(session_id, summary).await;
        }
    }
}

/// Truncate at a char boundary.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
