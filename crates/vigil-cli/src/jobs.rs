//! `vigil job` subcommands: direct store access, no running daemon needed.

use std::path::PathBuf;

use clap::Subcommand;

use vigil_store::{JobFilter, JobStore, JobUpdate, NewJob};
use vigil_types::{ExecutionMode, Job, JobKind, Schedule};

#[derive(Subcommand)]
pub enum JobCommand {
    /// Add a scheduled job
    Add {
        /// Optional human-readable label
        #[arg(long)]
        name: Option<String>,

        /// Job kind: "cron", "heartbeat-recurring" or "heartbeat-oneoff"
        #[arg(long)]
        kind: JobKind,

        /// Fixed interval in seconds (exclusive with --cron)
        #[arg(long)]
        every: Option<u64>,

        /// 5-field cron expression, e.g. "0 9 * * 1-5" (exclusive with --every)
        #[arg(long)]
        cron: Option<String>,

        /// Execution mode: "isolated" or "session"
        #[arg(long, default_value = "isolated")]
        mode: ExecutionMode,

        /// Instruction payload for the spawned agent
        #[arg(short, long)]
        message: String,

        /// Target session for result delivery
        #[arg(long)]
        session: Option<String>,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Update fields of an existing job
    Update {
        /// Job id
        id: String,

        #[arg(long)]
        name: Option<String>,

        /// Drop the label entirely (exclusive with --name)
        #[arg(long, conflicts_with = "name")]
        clear_name: bool,

        /// New fixed interval in seconds (exclusive with --cron)
        #[arg(long)]
        every: Option<u64>,

        /// New cron expression (exclusive with --every)
        #[arg(long)]
        cron: Option<String>,

        #[arg(long)]
        mode: Option<ExecutionMode>,

        #[arg(short, long)]
        message: Option<String>,

        #[arg(long)]
        session: Option<String>,
    },
    /// Remove a job and its run history
    Remove {
        /// Job id
        id: String,
    },
    /// List jobs
    List {
        /// Only enabled jobs
        #[arg(long)]
        enabled_only: bool,

        /// Filter by kind
        #[arg(long)]
        kind: Option<JobKind>,
    },
    /// Enable a job; its next fire is computed from now
    Enable {
        /// Job id
        id: String,
    },
    /// Disable a job without removing it
    Disable {
        /// Job id
        id: String,
    },
}

pub async fn run_job(db: Option<PathBuf>, command: JobCommand) -> anyhow::Result<()> {
    let config = vigil_config::load_config().unwrap_or_default();
    let db_path = match db {
        Some(p) => p,
        None => vigil_config::resolve_db_path(&config)?,
    };
    let store = JobStore::open(&db_path)?;

    match command {
        JobCommand::Add {
            name,
            kind,
            every,
            cron,
            mode,
            message,
            session,
            disabled,
        } => {
            let schedule = schedule_from_flags(every, cron)?
                .ok_or_else(|| anyhow::anyhow!("pass exactly one of --every and --cron"))?;
            let job = store
                .add_job(NewJob {
                    name,
                    kind,
                    schedule,
                    mode,
                    message,
                    session_id: session,
                    enabled: !disabled,
                })
                .await?;
            println!("Added job {}", job.id);
            print_job(&job);
        }
        JobCommand::Update {
            id,
            name,
            clear_name,
            every,
            cron,
            mode,
            message,
            session,
        } => {
            let job = store
                .update_job(
                    &id,
                    JobUpdate {
                        name,
                        clear_name,
                        schedule: schedule_from_flags(every, cron)?,
                        mode,
                        message,
                        session_id: session,
                    },
                )
                .await?;
            println!("Updated job {}", job.id);
            print_job(&job);
        }
        JobCommand::Remove { id } => {
            if store.remove_job(&id).await? {
                println!("Removed job {id}");
            } else {
                println!("No job with id {id}");
            }
        }
        JobCommand::List { enabled_only, kind } => {
            let jobs = store.list_jobs(JobFilter { enabled_only, kind }).await?;
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in &jobs {
                print_job(job);
            }
        }
        JobCommand::Enable { id } => {
            if store.set_enabled(&id, true).await? {
                println!("Enabled job {id}");
            } else {
                println!("No job with id {id}");
            }
        }
        JobCommand::Disable { id } => {
            if store.set_enabled(&id, false).await? {
                println!("Disabled job {id}");
            } else {
                println!("No job with id {id}");
            }
        }
    }

    Ok(())
}

/// Jobs carry exactly one trigger. Both flags set is an error; neither is
/// valid only for updates that keep the existing schedule.
fn schedule_from_flags(every: Option<u64>, cron: Option<String>) -> anyhow::Result<Option<Schedule>> {
    match (every, cron) {
        (Some(_), Some(_)) => anyhow::bail!("pass --every or --cron, not both"),
        (Some(seconds), None) => Ok(Some(Schedule::Every { seconds })),
        (None, Some(expr)) => Ok(Some(Schedule::Cron { expr })),
        (None, None) => Ok(None),
    }
}

fn print_job(job: &Job) {
    println!(
        "{}  [{}] {} {} ({})",
        job.id,
        if job.enabled { "on " } else { "off" },
        job.kind,
        job.schedule,
        job.mode,
    );
    if let Some(name) = &job.name {
        println!("    name:    {name}");
    }
    println!("    message: {}", job.message);
    if let Some(session) = &job.session_id {
        println!("    session: {session}");
    }
    if let Some(next) = &job.next_run_at {
        println!("    next:    {}", next.to_rfc3339());
    }
    if let Some(last) = &job.last_run_at {
        println!("    last:    {}", last.to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_from_flags() {
        assert!(matches!(
            schedule_from_flags(Some(60), None),
            Ok(Some(Schedule::Every { seconds: 60 }))
        ));
        assert!(matches!(
            schedule_from_flags(None, Some("0 9 * * *".into())),
            Ok(Some(Schedule::Cron { .. }))
        ));
        assert!(matches!(schedule_from_flags(None, None), Ok(None)));
        assert!(schedule_from_flags(Some(60), Some("* * * * *".into())).is_err());
    }
}
