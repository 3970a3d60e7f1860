//! vigil-types: shared domain types for the vigil runtime.
//!
//! Defines jobs, tasks, schedules, execution modes, and the wire types
//! exchanged with the control endpoint. Schedule parsing and next-fire
//! computation live here so both the store (write-time validation) and
//! the scheduler (recomputation after each fire) share one implementation.

pub mod schedule;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use schedule::{Schedule, ScheduleError};

// ──────────────────── Jobs ────────────────────

/// What kind of scheduling intent a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Fires on a cron expression.
    Cron,
    /// Recurring heartbeat check on a fixed interval.
    HeartbeatRecurring,
    /// One-shot heartbeat; removed after its single fire.
    HeartbeatOneoff,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Cron => write!(f, "cron"),
            JobKind::HeartbeatRecurring => write!(f, "heartbeat-recurring"),
            JobKind::HeartbeatOneoff => write!(f, "heartbeat-oneoff"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(JobKind::Cron),
            "heartbeat-recurring" => Ok(JobKind::HeartbeatRecurring),
            "heartbeat-oneoff" => Ok(JobKind::HeartbeatOneoff),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// How a task executes and where its result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fresh context, no conversation history; result injected or handed
    /// to a direct caller. Isolated tasks run fully in parallel.
    Isolated,
    /// Runs inside the target session's turn sequence; serialized per
    /// session id.
    Session,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Isolated => write!(f, "isolated"),
            ExecutionMode::Session => write!(f, "session"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolated" => Ok(ExecutionMode::Isolated),
            "session" => Ok(ExecutionMode::Session),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// A persisted scheduling intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, stable for the job's lifetime.
    pub id: String,
    /// Optional human label; not unique.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: JobKind,
    pub schedule: Schedule,
    pub mode: ExecutionMode,
    /// Instruction payload handed to the spawned agent.
    pub message: String,
    /// Target session for result delivery. The store requires this on
    /// every job: fires have no direct caller, so a job without a
    /// session could never deliver its results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// None iff disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ──────────────────── Tasks ────────────────────

/// Lifecycle state of a task. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Delivered,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Delivered | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Delivered => write!(f, "delivered"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a sub-agent execution produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// A reportable result worth surfacing to the user.
    Report { content: String },
    /// The sub-agent ran fine but found nothing worth surfacing.
    /// Distinct from an empty report; the bus drops it without injection.
    Quiet,
}

/// Point-in-time snapshot of a task, served by the control endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_job_id: Option<String>,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Set exactly once, on the transition into Delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    /// Diagnostic captured on Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ──────────────────── Sessions ────────────────────

/// Liveness and continuity state for one chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    /// True while the main agent loop is actively turn-taking.
    pub is_live: bool,
    /// Carried-forward summary from the previous isolated run, so a
    /// recurring check can suppress re-reporting unchanged state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_history_ref: Option<String>,
}

// ──────────────────── Control-plane wire types ────────────────────

/// Request body for POST /spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub message: String,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Execution deadline in seconds; the runtime default applies if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Isolated
}

/// Response body for POST /spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub task_id: String,
}
