//! vigil-store: SQLite-backed persistence for jobs and run history.
//!
//! Durable CRUD over job records plus a capped per-job run-history log used
//! for rolling continuity. Schedule validation happens here at write time so
//! malformed jobs are rejected before they ever reach the scheduler.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use vigil_types::{ExecutionMode, Job, JobKind, Schedule, ScheduleError};

/// Rows of run history kept per job. Older rows are trimmed on append.
pub const RUN_HISTORY_CAP: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
    #[error("job has no delivery target: session_id is required")]
    MissingSession,
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("corrupt job record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Fields supplied when creating a job. The store assigns the id, creation
/// time, and initial next-run time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: Option<String>,
    pub kind: JobKind,
    pub schedule: Schedule,
    pub mode: ExecutionMode,
    pub message: String,
    pub session_id: Option<String>,
    pub enabled: bool,
}

/// Partial update for an existing job. `None` fields are left untouched.
///
/// `clear_name` drops the name back to `None` and wins over `name`. There is
/// no equivalent for `session_id`: a job must keep a delivery target, so the
/// session can be changed but never cleared.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub clear_name: bool,
    pub schedule: Option<Schedule>,
    pub mode: Option<ExecutionMode>,
    pub message: Option<String>,
    pub session_id: Option<String>,
}

/// Listing filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub enabled_only: bool,
    pub kind: Option<JobKind>,
}

/// SQLite-based job store.
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

const JOB_COLUMNS: &str =
    "id, name, kind, schedule, mode, message, session_id, enabled, last_run_at, next_run_at, created_at";

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;

         CREATE TABLE IF NOT EXISTS jobs (
             id TEXT PRIMARY KEY,
             name TEXT,
             kind TEXT NOT NULL,
             schedule TEXT NOT NULL,
             mode TEXT NOT NULL,
             message TEXT NOT NULL,
             session_id TEXT,
             enabled INTEGER NOT NULL DEFAULT 1,
             last_run_at TEXT,
             next_run_at TEXT,
             created_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS job_runs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             job_id TEXT NOT NULL,
             summary TEXT NOT NULL,
             ran_at INTEGER NOT NULL
         );

         CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id, id);",
    )
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let kind: String = row.get(2)?;
    let schedule: String = row.get(3)?;
    let mode: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind.parse().map_err(|e: String| conversion_err(2, e))?,
        schedule: serde_json::from_str(&schedule)
            .map_err(|e| conversion_err(3, e.to_string()))?,
        mode: mode.parse().map_err(|e: String| conversion_err(4, e))?,
        message: row.get(5)?,
        session_id: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        last_run_at: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| s.parse().ok()),
        next_run_at: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| s.parse().ok()),
        created_at: row
            .get::<_, String>(10)?
            .parse()
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(msg)),
    )
}

fn upsert_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO jobs
            (id, name, kind, schedule, mode, message, session_id, enabled, last_run_at, next_run_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            job.id,
            job.name,
            job.kind.to_string(),
            serde_json::to_string(&job.schedule)?,
            job.mode.to_string(),
            job.message,
            job.session_id,
            job.enabled as i64,
            job.last_run_at.map(|t| t.to_rfc3339()),
            job.next_run_at.map(|t| t.to_rfc3339()),
            job.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn get_job_sync(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
    Ok(stmt
        .query_row(rusqlite::params![id], job_from_row)
        .optional()?)
}

impl JobStore {
    /// Open (or create) the job database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        tracing::info!("Job store opened: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a job. Validates the schedule and delivery target first;
    /// nothing is persisted when validation fails.
    ///
    /// Every job needs a session: fires have no direct caller, so a job
    /// without one could never deliver its results.
    pub async fn add_job(&self, new: NewJob) -> Result<Job> {
        new.schedule.validate()?;
        if new.session_id.is_none() {
            return Err(StoreError::MissingSession);
        }
        let now = Utc::now();
        let next_run_at = if new.enabled {
            Some(new.schedule.first_fire(now)?)
        } else {
            None
        };
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            kind: new.kind,
            schedule: new.schedule,
            mode: new.mode,
            message: new.message,
            session_id: new.session_id,
            enabled: new.enabled,
            last_run_at: None,
            next_run_at,
            created_at: now,
        };

        let conn = self.conn.clone();
        let stored = job.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            upsert_job(&conn, &stored)
        })
        .await??;
        tracing::info!(job_id = %job.id, kind = %job.kind, schedule = %job.schedule, "Job created");
        Ok(job)
    }

    /// Apply a partial update. A changed schedule is revalidated and the
    /// next-run time recomputed; an invalid schedule leaves the job as it was.
    pub async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        if let Some(schedule) = &update.schedule {
            schedule.validate()?;
        }
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut job = get_job_sync(&conn, &id)?.ok_or(StoreError::JobNotFound(id))?;
            if update.clear_name {
                job.name = None;
            } else if let Some(name) = update.name {
                job.name = Some(name);
            }
            if let Some(message) = update.message {
                job.message = message;
            }
            if let Some(mode) = update.mode {
                job.mode = mode;
            }
            if let Some(session_id) = update.session_id {
                job.session_id = Some(session_id);
            }
            if job.session_id.is_none() {
                return Err(StoreError::MissingSession);
            }
            if let Some(schedule) = update.schedule {
                job.next_run_at = if job.enabled {
                    Some(schedule.first_fire(Utc::now())?)
                } else {
                    None
                };
                job.schedule = schedule;
            }
            upsert_job(&conn, &job)?;
            Ok(job)
        })
        .await?
    }

    /// Delete a job and its run history. Returns false if it did not exist.
    pub async fn remove_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM job_runs WHERE job_id = ?1", rusqlite::params![id])?;
            let count = conn.execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])?;
            Ok(count > 0)
        })
        .await?
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            get_job_sync(&conn, &id)
        })
        .await?
    }

    /// List jobs, optionally filtered by enabled state and kind.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at"
            ))?;
            let jobs = stmt
                .query_map([], job_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs
                .into_iter()
                .filter(|j| !filter.enabled_only || j.enabled)
                .filter(|j| filter.kind.is_none_or(|k| j.kind == k))
                .collect())
        })
        .await?
    }

    /// Jobs that are enabled and due at `now`.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.list_jobs(JobFilter { enabled_only: true, kind: None }).await?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.next_run_at.is_some_and(|next| next <= now))
            .collect())
    }

    /// Enable or disable a job. Enabling recomputes the next-run time from
    /// now; disabling clears it. Returns false if the job does not exist.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let Some(mut job) = get_job_sync(&conn, &id)? else {
                return Ok(false);
            };
            job.enabled = enabled;
            job.next_run_at = if enabled {
                Some(job.schedule.first_fire(Utc::now())?)
            } else {
                None
            };
            upsert_job(&conn, &job)?;
            Ok(true)
        })
        .await?
    }

    /// Record a fire: update last-run and next-run timestamps.
    pub async fn mark_fired(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE jobs SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
                rusqlite::params![
                    last_run_at.to_rfc3339(),
                    next_run_at.map(|t| t.to_rfc3339()),
                    id
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Disable a job whose schedule has become unusable, keeping it visible.
    pub async fn disable_invalid(&self, id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE jobs SET enabled = 0, next_run_at = NULL WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await?
    }

    // ─── Run history ───────────────────────────────────────

    /// Append a run summary for a job, trimming history past the cap in the
    /// same write.
    pub async fn append_run(&self, job_id: &str, summary: &str) -> Result<()> {
        let conn = self.conn.clone();
        let job_id = job_id.to_string();
        let summary = summary.to_string();
        let now = Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO job_runs (job_id, summary, ran_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![job_id, summary, now],
            )?;
            conn.execute(
                "DELETE FROM job_runs WHERE job_id = ?1 AND id NOT IN (
                     SELECT id FROM job_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                rusqlite::params![job_id, RUN_HISTORY_CAP as i64],
            )?;
            Ok(())
        })
        .await?
    }

    /// Most recent run summary for a job, if any. Feeds rolling continuity
    /// for recurring isolated runs.
    pub async fn last_run_summary(&self, job_id: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    "SELECT summary FROM job_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                    rusqlite::params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// Number of history rows for a job.
    pub async fn run_count(&self, job_id: &str) -> Result<usize> {
        let conn = self.conn.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM job_runs WHERE job_id = ?1",
                rusqlite::params![job_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await?
    }
}
