//! The executor collaborator seam.
//!
//! The orchestrator never runs a sub-agent itself; it hands an `ExecSpec`
//! to an `Executor` and awaits the single terminal outcome. Cancellation is
//! advisory: the token is checked at the executor's safe points, never
//! enforced by killing from this layer.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vigil_types::{ExecutionMode, TaskOutcome};

/// Everything an executor needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub task_id: String,
    pub source_job_id: Option<String>,
    pub mode: ExecutionMode,
    pub session_id: Option<String>,
    /// Instruction payload for the sub-agent.
    pub message: String,
    /// Summary of the previous run for recurring isolated checks, so the
    /// sub-agent can suppress re-reporting unchanged state.
    pub rolling_history_ref: Option<String>,
    pub deadline: Duration,
}

/// Executor-side failure. A deadline overrun is reported by the
/// orchestrator with the same shape.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("execution failed: {0}")]
    Failed(String),
    #[error("execution cancelled")]
    Cancelled,
}

/// Runs a sub-agent to a single terminal outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        spec: &ExecSpec,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ExecError>;
}
