//! vigil-bus: the result bus and session registry.
//!
//! Every task's terminal output passes through `ResultBus::deliver` exactly
//! once (the orchestrator's single-writer terminal state guarantees the
//! "once"). The bus decides the destination: a direct caller's oneshot, an
//! injection into a session transcript, or a logged drop for no-op
//! completions.

pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

pub use registry::SessionRegistry;

/// What the bus hands to a destination.
#[derive(Debug)]
pub enum DeliveredResult {
    /// A reportable sub-agent result.
    Report(String),
    /// Distinct no-op completion: the sub-agent had nothing noteworthy.
    Quiet,
    /// Execution failure. In isolated mode a failure is itself noteworthy
    /// and gets surfaced.
    Failure(String),
}

/// Where a terminal result goes. Closed set, matched exhaustively in
/// `deliver`.
pub enum Destination {
    /// Ad-hoc spawn with a direct caller waiting on the outcome.
    Caller(oneshot::Sender<DeliveredResult>),
    /// Inject into a session transcript. Waits for the turn boundary when
    /// the session is live.
    Session { session_id: String },
    /// A session-mode task's own output: delivery is the act of completing
    /// the in-flight turn, so it never queues behind liveness.
    Turn { session_id: String },
}

/// Injection entry point exposed by the conversational loop. The bus never
/// formats for a specific chat transport; the sink owns that.
#[async_trait::async_trait]
pub trait SessionSink: Send + Sync {
    async fn inject(&self, session_id: &str, content: &str) -> anyhow::Result<()>;
}

/// Single funnel routing terminal task outcomes to their destinations.
pub struct ResultBus {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn SessionSink>,
    /// Per-session delivery locks. FIFO lock acquisition preserves
    /// terminal-completion order within a session and keeps an injection
    /// from landing mid-turn.
    delivery_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResultBus {
    pub fn new(registry: Arc<SessionRegistry>, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            registry,
            sink,
            delivery_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Deliver one terminal result. Invoked exactly once per task by the
    /// orchestrator.
    pub async fn deliver(
        &self,
        task_id: &str,
        result: DeliveredResult,
        destination: Destination,
    ) -> anyhow::Result<()> {
        if matches!(result, DeliveredResult::Quiet) {
            debug!(task_id, "Nothing to report, dropping result");
            return Ok(());
        }

        match destination {
            Destination::Caller(tx) => {
                if tx.send(result).is_err() {
                    warn!(task_id, "Caller went away before delivery");
                }
                Ok(())
            }
            Destination::Session { session_id } => {
                let content = render(task_id, result);
                let lock = self.session_lock(&session_id).await;
                // Held across the injection: FIFO acquisition preserves
                // terminal-completion order, and two results for the same
                // session can never interleave.
                let _guard = lock.lock().await;
                if self.registry.is_live(&session_id).await {
                    info!(task_id, session_id, "Session live, holding result for the turn boundary");
                }
                self.registry.wait_until_idle(&session_id).await;
                info!(task_id, session_id, "Injecting result");
                self.sink.inject(&session_id, &content).await
            }
            Destination::Turn { session_id } => {
                // The turn's own output. The orchestrator's execution lock
                // already serializes turns, and waiting for idle here would
                // deadlock on the liveness this same turn holds.
                let content = render(task_id, result);
                info!(task_id, session_id, "Completing turn with result");
                self.sink.inject(&session_id, &content).await
            }
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.delivery_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Text handed to the sink for a routed result.
fn render(task_id: &str, result: DeliveredResult) -> String {
    match result {
        DeliveredResult::Report(content) => content,
        DeliveredResult::Failure(reason) => {
            format!("[background task {task_id} failed]\n{reason}")
        }
        DeliveredResult::Quiet => unreachable!("dropped before routing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Records injections in order; optional artificial delay per call.
    struct RecordingSink {
        injected: std::sync::Mutex<Vec<(String, String)>>,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                injected: std::sync::Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                injected: std::sync::Mutex::new(Vec::new()),
                delay: Some(delay),
            })
        }

        fn entries(&self) -> Vec<(String, String)> {
            self.injected.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SessionSink for RecordingSink {
        async fn inject(&self, session_id: &str, content: &str) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.injected
                .lock()
                .unwrap()
                .push((session_id.to_string(), content.to_string()));
            Ok(())
        }
    }

    fn bus_with(sink: Arc<RecordingSink>) -> Arc<ResultBus> {
        Arc::new(ResultBus::new(Arc::new(SessionRegistry::new()), sink))
    }

    #[tokio::test]
    async fn quiet_result_is_dropped() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink.clone());

        bus.deliver(
            "t1",
            DeliveredResult::Quiet,
            Destination::Session {
                session_id: "main".into(),
            },
        )
        .await
        .unwrap();

        assert!(sink.entries().is_empty());
    }

    #[tokio::test]
    async fn report_reaches_direct_caller() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink.clone());
        let (tx, rx) = oneshot::channel();

        bus.deliver("t1", DeliveredResult::Report("42 degrees".into()), Destination::Caller(tx))
            .await
            .unwrap();

        match rx.await.unwrap() {
            DeliveredResult::Report(content) => assert_eq!(content, "42 degrees"),
            other => panic!("unexpected delivery: {other:?}"),
        }
        // Direct-caller delivery never touches the session sink.
        assert!(sink.entries().is_empty());
    }

    #[tokio::test]
    async fn report_injected_into_session() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink.clone());
        bus.registry().mark_idle("main").await;

        bus.deliver(
            "t1",
            DeliveredResult::Report("inbox clear".into()),
            Destination::Session {
                session_id: "main".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(sink.entries(), vec![("main".into(), "inbox clear".into())]);
    }

    #[tokio::test]
    async fn failure_is_surfaced_with_diagnostic() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink.clone());

        bus.deliver(
            "t9",
            DeliveredResult::Failure("deadline exceeded".into()),
            Destination::Session {
                session_id: "main".into(),
            },
        )
        .await
        .unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].1.contains("deadline exceeded"));
        assert!(entries[0].1.contains("t9"));
    }

    #[tokio::test]
    async fn same_session_deliveries_keep_completion_order() {
        let sink = RecordingSink::with_delay(Duration::from_millis(20));
        let bus = bus_with(sink.clone());

        let mut handles = Vec::new();
        for i in 0..4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                bus.deliver(
                    &format!("t{i}"),
                    DeliveredResult::Report(format!("msg {i}")),
                    Destination::Session {
                        session_id: "main".into(),
                    },
                )
                .await
                .unwrap();
            }));
            // Stagger spawns so completion order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents: Vec<String> = sink.entries().into_iter().map(|(_, c)| c).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3"]);
    }

    #[tokio::test]
    async fn injection_waits_for_turn_boundary_on_live_session() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink.clone());
        bus.registry().mark_live("main").await;

        let delivering = bus.clone();
        let delivery = tokio::spawn(async move {
            delivering
                .deliver(
                    "t1",
                    DeliveredResult::Report("queued".into()),
                    Destination::Session {
                        session_id: "main".into(),
                    },
                )
                .await
                .unwrap();
        });

        // Mid-turn: the result is held back, nothing reaches the sink.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.entries().is_empty());
        assert!(!delivery.is_finished());

        bus.registry().mark_idle("main").await;
        delivery.await.unwrap();
        assert_eq!(sink.entries(), vec![("main".into(), "queued".into())]);
    }

    #[tokio::test]
    async fn turn_completion_is_never_queued_behind_its_own_liveness() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink.clone());
        bus.registry().mark_live("main").await;

        bus.deliver(
            "t1",
            DeliveredResult::Report("turn output".into()),
            Destination::Turn {
                session_id: "main".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(sink.entries(), vec![("main".into(), "turn output".into())]);
    }

    #[tokio::test]
    async fn caller_gone_is_not_an_error() {
        let sink = RecordingSink::new();
        let bus = bus_with(sink);
        let (tx, rx) = oneshot::channel();
        drop(rx);

        // Logged, not propagated.
        bus.deliver("t1", DeliveredResult::Report("late".into()), Destination::Caller(tx))
            .await
            .unwrap();
    }
}
