//! Session liveness registry.
//!
//! The conversational loop marks sessions live while actively turn-taking
//! and idle otherwise; the bus and orchestrator only read. The registry
//! also carries each session's rolling continuity token.

use std::collections::HashMap;

use tokio::sync::{Mutex, RwLock, watch};

use vigil_types::SessionHandle;

/// Tracks which chat sessions are live and their continuity state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Latest liveness per session; deliveries queued behind a live turn
    /// park on the watch channel until the turn boundary.
    liveness: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            liveness: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a session as actively turn-taking.
    pub async fn mark_live(&self, session_id: &str) {
        self.set_live(session_id, true).await;
    }

    /// Mark a session idle. Releases deliveries waiting on the turn
    /// boundary.
    pub async fn mark_idle(&self, session_id: &str) {
        self.set_live(session_id, false).await;
    }

    async fn set_live(&self, session_id: &str, live: bool) {
        {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionHandle {
                    session_id: session_id.to_string(),
                    is_live: live,
                    rolling_history_ref: None,
                })
                .is_live = live;
        }
        let mut liveness = self.liveness.lock().await;
        liveness
            .entry(session_id.to_string())
            .or_insert_with(|| watch::channel(live).0)
            .send_replace(live);
    }

    /// Wait until the session is idle. Returns immediately for idle or
    /// unknown sessions.
    pub async fn wait_until_idle(&self, session_id: &str) {
        let mut rx = {
            let mut liveness = self.liveness.lock().await;
            liveness
                .entry(session_id.to_string())
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };
        // The sender lives in the map for the registry's lifetime, so the
        // channel cannot close under a waiter.
        let _ = rx.wait_for(|live| !*live).await;
    }

    /// Whether a session is currently mid-conversation. Unknown sessions
    /// are idle.
    pub async fn is_live(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.is_live)
    }

    /// Record the latest delivered summary for a session, overwriting the
    /// previous one. Bounded by construction: one token per session.
    pub async fn set_rolling_ref(&self, session_id: &str, summary: &str) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHandle {
                session_id: session_id.to_string(),
                is_live: false,
                rolling_history_ref: None,
            })
            .rolling_history_ref = Some(summary.to_string());
    }

    pub async fn rolling_ref(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.rolling_history_ref.clone())
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_session_is_idle() {
        let registry = SessionRegistry::new();
        assert!(!registry.is_live("nope").await);
    }

    #[tokio::test]
    async fn live_idle_transitions() {
        let registry = SessionRegistry::new();
        registry.mark_live("main").await;
        assert!(registry.is_live("main").await);

        registry.mark_idle("main").await;
        assert!(!registry.is_live("main").await);

        let handle = registry.get("main").await.unwrap();
        assert_eq!(handle.session_id, "main");
        assert!(!handle.is_live);
    }

    #[tokio::test]
    async fn rolling_ref_overwrites() {
        let registry = SessionRegistry::new();
        assert!(registry.rolling_ref("main").await.is_none());

        registry.set_rolling_ref("main", "reported 3 emails").await;
        registry.set_rolling_ref("main", "nothing new").await;
        assert_eq!(
            registry.rolling_ref("main").await.as_deref(),
            Some("nothing new")
        );
    }

    #[tokio::test]
    async fn list_sessions() {
        let registry = SessionRegistry::new();
        registry.mark_live("a").await;
        registry.mark_idle("b").await;
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn wait_until_idle_is_immediate_for_unknown_session() {
        let registry = SessionRegistry::new();
        registry.wait_until_idle("never-seen").await;
    }

    #[tokio::test]
    async fn wait_until_idle_parks_until_turn_boundary() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        registry.mark_live("main").await;

        let waiting = registry.clone();
        let waiter = tokio::spawn(async move {
            waiting.wait_until_idle("main").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        registry.mark_idle("main").await;
        waiter.await.unwrap();
    }
}
