//! In-memory task records with single-assignment terminal state.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use vigil_bus::Destination;
use vigil_types::{TaskOutcome, TaskState, TaskStatus};

/// One tracked task. The record is only ever mutated under its mutex; the
/// terminal transition is first-writer-wins.
pub(crate) struct TaskSlot {
    pub record: std::sync::Mutex<TaskStatus>,
    /// Taken exactly once by the winning terminal transition.
    pub destination: std::sync::Mutex<Option<Destination>>,
    pub cancel: CancellationToken,
}

impl TaskSlot {
    pub fn new(status: TaskStatus, destination: Destination) -> Self {
        Self {
            record: std::sync::Mutex::new(status),
            destination: std::sync::Mutex::new(Some(destination)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> TaskStatus {
        self.record
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot().state.is_terminal()
    }

    /// Transition Pending → Running. No-op if a cancel already won.
    pub fn mark_running(&self) {
        let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
        if record.state == TaskState::Pending {
            record.state = TaskState::Running;
            record.started_at = Some(Utc::now());
        }
    }

    /// Attempt the terminal transition. Returns false when the task is
    /// already terminal; the caller must then treat the report as a
    /// duplicate and deliver nothing.
    pub fn try_finish(
        &self,
        state: TaskState,
        outcome: Option<TaskOutcome>,
        error: Option<String>,
    ) -> bool {
        debug_assert!(state.is_terminal());
        let mut record = self.record.lock().unwrap_or_else(|p| p.into_inner());
        if record.state.is_terminal() {
            return false;
        }
        record.state = state;
        record.outcome = outcome;
        record.error = error;
        record.ended_at = Some(Utc::now());
        true
    }

    /// The delivery destination, surrendered to the winning terminal
    /// transition only.
    pub fn take_destination(&self) -> Option<Destination> {
        self.destination
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::ExecutionMode;

    fn slot() -> TaskSlot {
        TaskSlot::new(
            TaskStatus {
                task_id: "t1".into(),
                source_job_id: None,
                mode: ExecutionMode::Isolated,
                session_id: Some("main".into()),
                state: TaskState::Pending,
                started_at: None,
                ended_at: None,
                outcome: None,
                error: None,
            },
            Destination::Session {
                session_id: "main".into(),
            },
        )
    }

    #[test]
    fn terminal_transition_is_single_assignment() {
        let slot = slot();
        slot.mark_running();
        assert!(slot.try_finish(
            TaskState::Delivered,
            Some(TaskOutcome::Report {
                content: "done".into()
            }),
            None,
        ));
        // Racing cancel loses; nothing about the record changes.
        assert!(!slot.try_finish(TaskState::Cancelled, None, None));

        let status = slot.snapshot();
        assert_eq!(status.state, TaskState::Delivered);
        assert!(status.outcome.is_some());
        assert!(status.ended_at.is_some());
    }

    #[test]
    fn cancel_wins_race_when_first() {
        let slot = slot();
        slot.mark_running();
        assert!(slot.try_finish(TaskState::Cancelled, None, None));
        assert!(!slot.try_finish(
            TaskState::Delivered,
            Some(TaskOutcome::Quiet),
            None
        ));
        assert_eq!(slot.snapshot().state, TaskState::Cancelled);
    }

    #[test]
    fn destination_taken_once() {
        let slot = slot();
        assert!(slot.take_destination().is_some());
        assert!(slot.take_destination().is_none());
    }

    #[test]
    fn running_not_marked_after_terminal() {
        let slot = slot();
        assert!(slot.try_finish(TaskState::Cancelled, None, None));
        slot.mark_running();
        assert_eq!(slot.snapshot().state, TaskState::Cancelled);
        assert!(slot.snapshot().started_at.is_none());
    }
}
