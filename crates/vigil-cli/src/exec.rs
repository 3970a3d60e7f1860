//! Process-backed executor for `vigil run`.
//!
//! Hands each task's message to a configured shell command on stdin and
//! reads the reply from stdout. An empty reply or the literal `NOTHING`
//! means the run found nothing worth surfacing.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vigil_orchestrator::{ExecError, ExecSpec, Executor};
use vigil_types::TaskOutcome;

const MAX_STDERR_CHARS: usize = 2000;

pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        spec: &ExecSpec,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ExecError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        cmd.env("VIGIL_TASK_ID", &spec.task_id);
        cmd.env("VIGIL_MODE", spec.mode.to_string());
        if let Some(session_id) = &spec.session_id {
            cmd.env("VIGIL_SESSION_ID", session_id);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Cancellation drops the wait future; the child must not outlive it.
        cmd.kill_on_drop(true);

        debug!(task_id = %spec.task_id, command = %self.command, "Launching executor process");
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Failed(format!("failed to spawn executor: {e}")))?;

        let payload = match &spec.rolling_history_ref {
            Some(prev) => format!("[previous run]\n{prev}\n\n{}", spec.message),
            None => spec.message.clone(),
        };
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ExecError::Failed(format!("failed to write message: {e}")))?;
            // Dropping the handle closes the pipe so the command sees EOF.
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            output = child.wait_with_output() => {
                output.map_err(|e| ExecError::Failed(format!("executor wait failed: {e}")))?
            }
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.len() > MAX_STDERR_CHARS {
                stderr.truncate(MAX_STDERR_CHARS);
                stderr.push_str("\n... [output truncated]");
            }
            return Err(ExecError::Failed(format!(
                "executor exited with code {code}: {}",
                stderr.trim()
            )));
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() || reply == "NOTHING" {
            Ok(TaskOutcome::Quiet)
        } else {
            Ok(TaskOutcome::Report { content: reply })
        }
    }
}
