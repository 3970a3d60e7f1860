//! vigil-scheduler: decides when each enabled job becomes due and emits
//! fire events.
//!
//! The scheduler only detects due jobs and dispatches them over a channel;
//! it never executes anything inline, so a slow task can never delay the
//! detection of the next due job. Missed fires during downtime are not
//! backfilled: a stale next-run time produces exactly one catch-up fire and
//! the schedule is re-anchored from the current clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_store::{JobFilter, JobStore};
use vigil_types::{Job, JobKind};

/// One due job, dispatched to the orchestrator.
#[derive(Debug, Clone)]
pub struct FireEvent {
    /// Snapshot of the job at fire time.
    pub job: Job,
    pub fired_at: DateTime<Utc>,
}

/// Tick-driven job scheduler.
pub struct Scheduler {
    store: Arc<JobStore>,
    fire_tx: mpsc::UnboundedSender<FireEvent>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        fire_tx: mpsc::UnboundedSender<FireEvent>,
        tick: Duration,
    ) -> Self {
        Self {
            store,
            fire_tx,
            tick,
        }
    }

    /// Run the scheduler loop until the shutdown token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(tick_secs = self.tick.as_secs(), "Scheduler started");
        if let Err(e) = self.prime(Utc::now()).await {
            warn!("Failed to prime job schedules: {e}");
        }
        loop {
            if let Err(e) = self.tick_once(Utc::now()).await {
                warn!("Scheduler tick failed: {e}");
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
    }

    /// Backfill missing next-run times for enabled jobs. Runs once at
    /// startup; an enabled job without a next-run time would otherwise
    /// never fire.
    pub async fn prime(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let jobs = self
            .store
            .list_jobs(JobFilter {
                enabled_only: true,
                kind: None,
            })
            .await?;
        for job in jobs {
            if job.next_run_at.is_some() {
                continue;
            }
            match job.schedule.first_fire(now) {
                Ok(next) => {
                    self.store
                        .mark_fired(&job.id, job.last_run_at.unwrap_or(now), Some(next))
                        .await?;
                    info!(job_id = %job.id, %next, "Primed next run time");
                }
                Err(e) => {
                    warn!(job_id = %job.id, "Schedule invalid at startup, disabling: {e}");
                    self.store.disable_invalid(&job.id).await?;
                }
            }
        }
        Ok(())
    }

    /// Detect and dispatch every job due at `now`, exactly once per due
    /// instant. Returns the number of fires emitted.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let due = self.store.due_jobs(now).await?;
        let mut fired = 0;
        for job in due {
            let Some(scheduled) = job.next_run_at else {
                continue;
            };
            info!(job_id = %job.id, kind = %job.kind, "Job due, dispatching");
            if self
                .fire_tx
                .send(FireEvent {
                    job: job.clone(),
                    fired_at: now,
                })
                .is_err()
            {
                warn!(job_id = %job.id, "Fire channel closed, dropping dispatch");
                return Ok(fired);
            }
            fired += 1;

            if job.kind == JobKind::HeartbeatOneoff {
                // One-shot: its single fire is done, remove the record.
                self.store.remove_job(&job.id).await?;
                info!(job_id = %job.id, "One-off heartbeat removed after fire");
                continue;
            }

            match job.schedule.next_after(scheduled, now) {
                Ok(next) => self.store.mark_fired(&job.id, now, Some(next)).await?,
                Err(e) => {
                    // Configuration error, not a crash: keep the job visible
                    // but stop scheduling it.
                    warn!(job_id = %job.id, "Schedule became invalid, disabling job: {e}");
                    self.store.disable_invalid(&job.id).await?;
                }
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use vigil_store::NewJob;
    use vigil_types::{ExecutionMode, Schedule};

    fn setup() -> (Arc<JobStore>, Scheduler, mpsc::UnboundedReceiver<FireEvent>) {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(store.clone(), tx, Duration::from_secs(30));
        (store, scheduler, rx)
    }

    fn heartbeat(seconds: u64, kind: JobKind) -> NewJob {
        NewJob {
            name: None,
            kind,
            schedule: Schedule::Every { seconds },
            mode: ExecutionMode::Isolated,
            message: "check inbox".into(),
            session_id: Some("main".into()),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn fires_due_job_exactly_once_per_instant() {
        let (store, scheduler, mut rx) = setup();
        let job = store
            .add_job(heartbeat(600, JobKind::HeartbeatRecurring))
            .await
            .unwrap();

        let due_at = job.next_run_at.unwrap() + ChronoDuration::seconds(1);
        assert_eq!(scheduler.tick_once(due_at).await.unwrap(), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.job.id, job.id);

        // Same instant again: next_run_at has advanced, nothing fires.
        assert_eq!(scheduler.tick_once(due_at).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn interval_advances_drift_free() {
        let (store, scheduler, _rx) = setup();
        let job = store
            .add_job(heartbeat(1200, JobKind::HeartbeatRecurring))
            .await
            .unwrap();
        let scheduled = job.next_run_at.unwrap();

        // Tick lands 40s late; next run is still scheduled + 1200s.
        let late = scheduled + ChronoDuration::seconds(40);
        scheduler.tick_once(late).await.unwrap();

        let after = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(
            after.next_run_at.unwrap() - scheduled,
            ChronoDuration::seconds(1200)
        );
    }

    #[tokio::test]
    async fn downtime_yields_single_catch_up() {
        let (store, scheduler, mut rx) = setup();
        let job = store
            .add_job(heartbeat(600, JobKind::HeartbeatRecurring))
            .await
            .unwrap();

        // Five intervals pass while the process is "down": one fire only.
        let much_later = job.next_run_at.unwrap() + ChronoDuration::seconds(3000);
        assert_eq!(scheduler.tick_once(much_later).await.unwrap(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Re-anchored from the catch-up instant.
        let after = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(
            after.next_run_at.unwrap(),
            much_later + ChronoDuration::seconds(600)
        );
    }

    #[tokio::test]
    async fn oneoff_heartbeat_removed_after_fire() {
        let (store, scheduler, mut rx) = setup();
        let job = store
            .add_job(heartbeat(300, JobKind::HeartbeatOneoff))
            .await
            .unwrap();

        let due_at = job.next_run_at.unwrap() + ChronoDuration::seconds(1);
        assert_eq!(scheduler.tick_once(due_at).await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().job.id, job.id);
        assert!(store.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_job_never_fires() {
        let (store, scheduler, mut rx) = setup();
        let job = store
            .add_job(heartbeat(60, JobKind::HeartbeatRecurring))
            .await
            .unwrap();
        let due_at = job.next_run_at.unwrap() + ChronoDuration::seconds(1);
        store.set_enabled(&job.id, false).await.unwrap();

        assert_eq!(scheduler.tick_once(due_at).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cron_job_advances_to_next_match() {
        let (store, scheduler, mut rx) = setup();
        let job = store
            .add_job(NewJob {
                kind: JobKind::Cron,
                schedule: Schedule::Cron {
                    expr: "0 9 * * *".into(),
                },
                ..heartbeat(0, JobKind::Cron)
            })
            .await
            .unwrap();

        let due_at = job.next_run_at.unwrap() + ChronoDuration::seconds(5);
        assert_eq!(scheduler.tick_once(due_at).await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().job.id, job.id);

        let after = store.get_job(&job.id).await.unwrap().unwrap();
        let next = after.next_run_at.unwrap();
        assert!(next > due_at);
        assert_eq!(next - job.next_run_at.unwrap(), ChronoDuration::days(1));
    }

    #[tokio::test]
    async fn prime_backfills_missing_next_run() {
        let (store, scheduler, _rx) = setup();
        let job = store
            .add_job(heartbeat(120, JobKind::HeartbeatRecurring))
            .await
            .unwrap();
        // Simulate a record that lost its next-run time.
        store
            .mark_fired(&job.id, Utc::now(), None)
            .await
            .unwrap();

        scheduler.prime(Utc::now()).await.unwrap();
        let after = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(after.next_run_at.is_some());
    }
}
