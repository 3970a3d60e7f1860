//! HTTP control endpoint served by `vigil run`.
//!
//! Routes: GET /health, POST /spawn, GET /tasks, GET /tasks/{id},
//! POST /tasks/{id}/cancel. All routes except /health require a bearer
//! token when one is configured.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tokio::sync::oneshot;

use vigil_bus::{DeliveredResult, SessionRegistry};
use vigil_orchestrator::{Orchestrator, OrchestratorError, TaskSpec};
use vigil_types::{SpawnRequest, SpawnResponse};

/// Shared control endpoint state.
pub struct ControlState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<SessionRegistry>,
    pub auth_token: Option<String>,
}

pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/spawn", post(spawn_handler))
        .route("/tasks", get(list_tasks_handler))
        .route("/tasks/{id}", get(task_status_handler))
        .route("/tasks/{id}/cancel", post(cancel_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/{id}/live", post(session_live_handler))
        .route("/sessions/{id}/idle", post(session_idle_handler))
        .with_state(state)
}

/// GET /health — simple HTTP health check, no auth.
async fn health_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "running_tasks": state.orchestrator.running_count(),
    }))
}

/// POST /spawn — create an ad-hoc task.
///
/// With a session_id the task id is returned immediately and the result is
/// injected into the session. Without one the request itself is the caller:
/// the handler waits for the terminal result and returns it in the body.
async fn spawn_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<SpawnRequest>,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;

    let deadline = req.deadline_secs.map(std::time::Duration::from_secs);
    let mut spec = TaskSpec {
        message: req.message,
        mode: req.mode,
        session_id: req.session_id.clone(),
        source_job_id: None,
        deadline,
        reply: None,
    };

    if req.session_id.is_some() {
        return match state.orchestrator.spawn(spec) {
            Ok(task_id) => Ok(axum::Json(SpawnResponse { task_id }).into_response()),
            Err(e) => Ok(bad_request(e)),
        };
    }

    let (tx, rx) = oneshot::channel();
    spec.reply = Some(tx);
    let task_id = match state.orchestrator.spawn(spec) {
        Ok(task_id) => task_id,
        Err(e) => return Ok(bad_request(e)),
    };
    let body = match rx.await {
        Ok(DeliveredResult::Report(content)) => json!({
            "task_id": task_id,
            "result": content,
        }),
        Ok(DeliveredResult::Quiet) => json!({
            "task_id": task_id,
            "result": serde_json::Value::Null,
        }),
        Ok(DeliveredResult::Failure(reason)) => json!({
            "task_id": task_id,
            "error": reason,
        }),
        // Channel dropped without a delivery: the task was cancelled.
        Err(_) => json!({
            "task_id": task_id,
            "error": "task was cancelled",
        }),
    };
    Ok(axum::Json(body).into_response())
}

/// GET /tasks — snapshots of every tracked task.
async fn list_tasks_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;
    let tasks = state.orchestrator.list_tasks();
    Ok(axum::Json(json!({ "tasks": tasks })).into_response())
}

/// GET /tasks/{id} — one task's snapshot.
async fn task_status_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;
    match state.orchestrator.status(&id) {
        Some(status) => Ok(axum::Json(status).into_response()),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// POST /tasks/{id}/cancel — request cooperative cancellation.
async fn cancel_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;
    match state.orchestrator.cancel(&id) {
        Ok(signalled) => Ok(axum::Json(json!({
            "task_id": id,
            "cancel_requested": signalled,
        }))
        .into_response()),
        Err(OrchestratorError::TaskNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Ok(bad_request(e)),
    }
}

/// GET /sessions — known sessions with liveness and continuity state.
async fn list_sessions_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;
    let sessions = state.registry.list().await;
    Ok(axum::Json(json!({ "sessions": sessions })).into_response())
}

/// POST /sessions/{id}/live — the conversational loop reports a turn
/// starting. Liveness steers whether injections land mid-conversation.
async fn session_live_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;
    state.registry.mark_live(&id).await;
    Ok(axum::Json(json!({ "session_id": id, "is_live": true })).into_response())
}

/// POST /sessions/{id}/idle — the conversational loop reports a turn done.
async fn session_idle_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, StatusCode> {
    authorize(&state, &headers)?;
    state.registry.mark_idle(&id).await;
    Ok(axum::Json(json!({ "session_id": id, "is_live": false })).into_response())
}

fn bad_request(e: OrchestratorError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// Authenticate if auth_token is configured.
fn authorize(state: &ControlState, headers: &HeaderMap) -> Result<(), StatusCode> {
    if let Some(expected_token) = &state.auth_token {
        match extract_bearer_token(headers) {
            Some(token) if token == expected_token => {}
            _ => {
                tracing::warn!("Control request authentication failed");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }
    Ok(())
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("my-secret-token"));
    }

    #[test]
    fn test_extract_bearer_token_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
