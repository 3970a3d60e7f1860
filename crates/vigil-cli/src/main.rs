mod client;
mod control;
mod exec;
mod jobs;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vigil", about = "Background task runtime CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime: store, scheduler, orchestrator, control endpoint
    Run {
        /// Database path (overrides config)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Scheduler tick resolution in seconds (overrides config)
        #[arg(long)]
        tick: Option<u64>,

        /// Control endpoint port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage scheduled jobs directly in the store
    Job {
        /// Database path (overrides config)
        #[arg(long)]
        db: Option<PathBuf>,

        #[command(subcommand)]
        command: jobs::JobCommand,
    },
    /// Spawn an ad-hoc task via a running control endpoint
    Spawn {
        /// Message to hand to the sub-agent
        #[arg(short, long)]
        message: String,

        /// Target session for result delivery; without one, the command
        /// waits for the result and prints it
        #[arg(long)]
        session: Option<String>,

        /// Execution mode: "isolated" or "session"
        #[arg(long, default_value = "isolated")]
        mode: vigil_types::ExecutionMode,

        /// Deadline in seconds (runtime default if unset)
        #[arg(long)]
        deadline: Option<u64>,

        /// Control endpoint URL
        #[arg(long, default_value = "http://127.0.0.1:4520")]
        url: String,

        /// Bearer token for authentication
        #[arg(long)]
        token: Option<String>,
    },
    /// Show one task, or all tracked tasks when no id is given
    Status {
        /// Task id
        task_id: Option<String>,

        /// Control endpoint URL
        #[arg(long, default_value = "http://127.0.0.1:4520")]
        url: String,

        /// Bearer token for authentication
        #[arg(long)]
        token: Option<String>,
    },
    /// Request cancellation of a running task
    Cancel {
        /// Task id
        task_id: String,

        /// Control endpoint URL
        #[arg(long, default_value = "http://127.0.0.1:4520")]
        url: String,

        /// Bearer token for authentication
        #[arg(long)]
        token: Option<String>,
    },
    /// Check runtime health
    Health {
        /// Control endpoint URL
        #[arg(long, default_value = "http://127.0.0.1:4520")]
        url: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { db, tick, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run::run_daemon(db, tick, port))?;
        }
        Commands::Job { db, command } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(jobs::run_job(db, command))?;
        }
        Commands::Spawn {
            message,
            session,
            mode,
            deadline,
            url,
            token,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(client::run_spawn(
                &url, token, message, mode, session, deadline,
            ))?;
        }
        Commands::Status {
            task_id,
            url,
            token,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(client::run_status(&url, token, task_id))?;
        }
        Commands::Cancel {
            task_id,
            url,
            token,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(client::run_cancel(&url, token, &task_id))?;
        }
        Commands::Health { url } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(client::run_health(&url))?;
        }
    }

    Ok(())
}
