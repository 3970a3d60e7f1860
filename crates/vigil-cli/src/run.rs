//! `vigil run`: wires the store, scheduler, orchestrator, result bus and
//! control endpoint into one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use vigil_bus::{ResultBus, SessionRegistry, SessionSink};
use vigil_orchestrator::Orchestrator;
use vigil_scheduler::Scheduler;
use vigil_store::JobStore;

use crate::control::{self, ControlState};
use crate::exec::CommandExecutor;

/// Session deliveries surface on the runtime log. The real chat surface is
/// an external collaborator; this sink is the seam it plugs into.
struct LogSink;

#[async_trait]
impl SessionSink for LogSink {
    async fn inject(&self, session_id: &str, content: &str) -> anyhow::Result<()> {
        info!(session_id, "Session delivery:\n{content}");
        Ok(())
    }
}

pub async fn run_daemon(
    db: Option<PathBuf>,
    tick: Option<u64>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let config = vigil_config::load_config().unwrap_or_default();

    let db_path = match db {
        Some(p) => p,
        None => vigil_config::resolve_db_path(&config)?,
    };
    let store = Arc::new(JobStore::open(&db_path)?);
    info!("Store opened: {}", db_path.display());

    let registry = Arc::new(SessionRegistry::new());
    let bus = Arc::new(ResultBus::new(registry.clone(), Arc::new(LogSink)));
    let executor = Arc::new(CommandExecutor::new(config.executor.command.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        bus,
        executor,
        Duration::from_secs(config.executor.default_deadline_secs),
    ));

    let (fire_tx, fire_rx) = mpsc::unbounded_channel();
    let tick = Duration::from_secs(tick.unwrap_or(config.scheduler.tick_secs));
    let scheduler = Scheduler::new(store.clone(), fire_tx, tick);

    let shutdown = CancellationToken::new();

    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });
    let fire_handle = tokio::spawn(
        orchestrator
            .clone()
            .run_fire_loop(fire_rx, shutdown.clone()),
    );

    let state = Arc::new(ControlState {
        orchestrator,
        registry,
        auth_token: config.control.auth_token.clone(),
    });
    let app = control::router(state);

    let port = port.unwrap_or(config.control.port);
    let addr: SocketAddr = format!("{}:{port}", config.control.host).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control endpoint listening on {addr}");
    info!("  Health: http://{addr}/health");
    info!("  Tick:   {}s", tick.as_secs());

    let ctrlc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            ctrlc_shutdown.cancel();
        }
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // Server is down; stop the loops before exiting.
    shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = fire_handle.await;
    info!("Runtime stopped");

    Ok(())
}
