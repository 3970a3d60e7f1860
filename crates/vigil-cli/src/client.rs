//! Control-endpoint client commands (`vigil spawn/status/cancel/health`).

use serde_json::Value;

use vigil_types::{ExecutionMode, SpawnRequest};

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn with_auth(rb: reqwest::RequestBuilder, token: &Option<String>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => rb.bearer_auth(token),
        None => rb,
    }
}

async fn read_json(resp: reqwest::Response) -> anyhow::Result<Value> {
    let status = resp.status();
    let body: Value = resp
        .json()
        .await
        .unwrap_or_else(|_| Value::String("<no body>".into()));
    if !status.is_success() {
        anyhow::bail!("control endpoint returned {status}: {body}");
    }
    Ok(body)
}

pub async fn run_spawn(
    url: &str,
    token: Option<String>,
    message: String,
    mode: ExecutionMode,
    session: Option<String>,
    deadline: Option<u64>,
) -> anyhow::Result<()> {
    let waiting = session.is_none();
    let req = SpawnRequest {
        message,
        mode,
        session_id: session,
        deadline_secs: deadline,
    };
    if waiting {
        println!("Waiting for result...");
    }
    let resp = with_auth(client().post(format!("{url}/spawn")).json(&req), &token)
        .send()
        .await?;
    let body = read_json(resp).await?;

    if let Some(task_id) = body.get("task_id").and_then(|v| v.as_str()) {
        println!("task: {task_id}");
    }
    if let Some(error) = body.get("error").and_then(|v| v.as_str()) {
        anyhow::bail!("task failed: {error}");
    }
    match body.get("result") {
        Some(Value::String(content)) => println!("{content}"),
        Some(Value::Null) => println!("(nothing to report)"),
        _ => {}
    }
    Ok(())
}

pub async fn run_status(
    url: &str,
    token: Option<String>,
    task_id: Option<String>,
) -> anyhow::Result<()> {
    let path = match &task_id {
        Some(id) => format!("{url}/tasks/{id}"),
        None => format!("{url}/tasks"),
    };
    let resp = with_auth(client().get(path), &token).send().await?;
    if task_id.is_some() && resp.status() == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("no such task");
    }
    let body = read_json(resp).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn run_cancel(url: &str, token: Option<String>, task_id: &str) -> anyhow::Result<()> {
    let resp = with_auth(
        client().post(format!("{url}/tasks/{task_id}/cancel")),
        &token,
    )
    .send()
    .await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("no such task");
    }
    let body = read_json(resp).await?;
    let signalled = body
        .get("cancel_requested")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if signalled {
        println!("Cancellation requested for {task_id}");
    } else {
        println!("Task {task_id} already finished");
    }
    Ok(())
}

pub async fn run_health(url: &str) -> anyhow::Result<()> {
    let resp = client().get(format!("{url}/health")).send().await?;
    let body = read_json(resp).await?;
    println!(
        "vigil is healthy (version {}, {} running tasks)",
        body.get("version").and_then(|v| v.as_str()).unwrap_or("?"),
        body.get("running_tasks").and_then(|v| v.as_u64()).unwrap_or(0),
    );
    Ok(())
}
