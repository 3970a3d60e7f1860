//! Schedule parsing and next-fire computation.
//!
//! A job carries exactly one of an interval or a five-field cron expression;
//! the enum makes the "exactly one" invariant structural. Cron expressions
//! are minute-resolution: a literal `0` seconds field is prepended before
//! handing the expression to the `cron` crate.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A validation failure for a job schedule.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("interval must be positive, got {0}")]
    NonPositiveInterval(u64),
    #[error("cron expression must have 5 fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Every N seconds, drift-free.
    Every { seconds: u64 },
    /// Five-field cron expression (minute resolution).
    Cron { expr: String },
}

impl Schedule {
    /// Validate the schedule. Called at job-write time so malformed jobs
    /// never reach the scheduler.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::Every { seconds } => {
                if *seconds == 0 {
                    return Err(ScheduleError::NonPositiveInterval(*seconds));
                }
                Ok(())
            }
            Schedule::Cron { expr } => {
                parse_cron(expr)?;
                Ok(())
            }
        }
    }

    /// First fire time for a freshly added or re-enabled job.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Schedule::Every { seconds } => {
                if *seconds == 0 {
                    return Err(ScheduleError::NonPositiveInterval(*seconds));
                }
                Ok(now + Duration::seconds(*seconds as i64))
            }
            Schedule::Cron { expr } => next_cron_match(expr, now),
        }
    }

    /// Next fire time after a fire that was scheduled for `scheduled`.
    ///
    /// Interval schedules advance from the scheduled instant, not from the
    /// wall clock at fire time, so handling latency never accumulates skew.
    /// If more than one interval was missed (process downtime), the schedule
    /// re-anchors at `now` — at most one catch-up fire, no backfill.
    pub fn next_after(
        &self,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Schedule::Every { seconds } => {
                if *seconds == 0 {
                    return Err(ScheduleError::NonPositiveInterval(*seconds));
                }
                let step = Duration::seconds(*seconds as i64);
                let next = scheduled + step;
                if next <= now {
                    Ok(now + step)
                } else {
                    Ok(next)
                }
            }
            Schedule::Cron { expr } => next_cron_match(expr, now),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Every { seconds } => write!(f, "every {seconds}s"),
            Schedule::Cron { expr } => write!(f, "cron '{expr}'"),
        }
    }
}

/// Parse a five-field cron expression, normalizing to the six-field form
/// the `cron` crate expects.
fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(ScheduleError::WrongFieldCount(fields));
    }
    let normalized = format!("0 {}", expr.trim());
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Chronologically nearest match strictly after `now`.
fn next_cron_match(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_cron(expr)?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: "no future match".into(),
        })
}
