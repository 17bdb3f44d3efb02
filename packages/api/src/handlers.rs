// ABOUTME: HTTP request handlers for sessions, runs, gateway resolution, and daemon stats
// ABOUTME: Thin layer over the run store, lifecycle engine, and gateway registry

use crate::response::{bad_request, internal_error, not_found, ok};
use crate::AppState;
use arena_orchestrator::{
    KillError, ModelProvider, ModelSpec, Run, RunPatch, RunStatus, StoreError,
};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

const MAX_MODELS_PER_SESSION: usize = 6;
const MIN_PROMPT_CHARS: usize = 10;

#[derive(Deserialize)]
pub struct ModelRequest {
    pub provider: String,
    pub model: String,
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub prompt: String,
    pub models: Vec<ModelRequest>,
}

/// POST /api/sessions — create a session with one run per model and start
/// them all.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    if request.prompt.trim().len() < MIN_PROMPT_CHARS {
        return bad_request(format!(
            "prompt must be at least {} characters",
            MIN_PROMPT_CHARS
        ));
    }
    if request.models.is_empty() || request.models.len() > MAX_MODELS_PER_SESSION {
        return bad_request(format!(
            "between 1 and {} models required",
            MAX_MODELS_PER_SESSION
        ));
    }

    let mut specs = Vec::with_capacity(request.models.len());
    for model in &request.models {
        let provider: ModelProvider = match model.provider.parse() {
            Ok(provider) => provider,
            Err(message) => return bad_request(message),
        };
        if model.model.trim().is_empty() {
            return bad_request("model name must not be empty");
        }
        specs.push(ModelSpec {
            provider,
            model: model.model.clone(),
        });
    }

    let (session, runs) = state.store.create_session(&request.prompt, &specs).await;
    info!("created session {} with {} runs", session.id, runs.len());

    if let Err(e) = state.engine.start_session(&session.id).await {
        return internal_error(format!("failed to start session runs: {}", e));
    }

    ok(json!({
        "sessionId": session.id,
        "runIds": runs.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
    }))
}

/// GET /api/sessions/{id} — session with joined runs; ready runs gain a
/// derived publicUrl under the preview domain.
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_session(&id).await {
        Ok((session, runs)) => {
            let runs: Vec<serde_json::Value> = runs
                .iter()
                .map(|run| run_json(run, &state.preview_domain))
                .collect();
            let mut body = serde_json::to_value(&session).unwrap_or_default();
            body["runs"] = json!(runs);
            ok(body)
        }
        Err(StoreError::SessionNotFound(_)) => not_found(format!("session not found: {}", id)),
        Err(e) => internal_error(e.to_string()),
    }
}

/// GET /api/runs/{id}
pub async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_run(&id).await {
        Ok(run) => ok(run_json(&run, &state.preview_domain)),
        Err(_) => not_found(format!("run not found: {}", id)),
    }
}

/// PATCH /api/runs/{id} — merge a partial update (orchestrator callback
/// counterpart when the UI runs in-process).
pub async fn patch_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<RunPatch>,
) -> Response {
    match state.store.update_run(&id, patch).await {
        Ok(run) => ok(run_json(&run, &state.preview_domain)),
        Err(_) => not_found(format!("run not found: {}", id)),
    }
}

/// POST /api/sessions/{id}/start
pub async fn start_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.start_session(&id).await {
        Ok(()) => ok(json!({ "ok": true })),
        Err(StoreError::SessionNotFound(_)) => not_found(format!("session not found: {}", id)),
        Err(e) => internal_error(e.to_string()),
    }
}

/// POST /api/runs/{id}/start
pub async fn start_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.start_run(&id).await {
        Ok(started) => {
            if started {
                info!("run {} (re)started", id);
            }
            ok(json!({ "ok": true }))
        }
        Err(StoreError::RunNotFound(_)) => not_found(format!("run not found: {}", id)),
        Err(e) => internal_error(e.to_string()),
    }
}

/// DELETE /api/runs/{id} — explicit kill.
pub async fn delete_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.kill_run(&id).await {
        Ok(()) => ok(json!({ "ok": true })),
        Err(KillError::Store(StoreError::RunNotFound(_))) => {
            not_found(format!("run not found: {}", id))
        }
        Err(KillError::Store(e)) => internal_error(e.to_string()),
        Err(KillError::Cleanup(e)) => internal_error(format!("cleanup failed: {}", e)),
    }
}

/// GET /api/runs/{id}/logs — runtime container logs, live when possible.
pub async fn get_run_logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.run_logs(&id).await {
        Ok(logs) => ok(json!({ "logs": logs })),
        Err(_) => not_found(format!("run not found: {}", id)),
    }
}

/// GET /gateway/resolve/{id} — reverse-proxy lookup.
pub async fn resolve(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.gateway.resolve(&id) {
        Some(url) => ok(json!({ "url": url })),
        None => not_found(format!("no live preview for run: {}", id)),
    }
}

/// GET /health
pub async fn health() -> Response {
    ok(json!({
        "status": "healthy",
        "service": "arena-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Response {
    ok(json!({
        "activeContainers": state.store.active_container_count().await,
        "registeredRuns": state.gateway.len(),
    }))
}

/// Serialize a run, attaching the derived preview URL once it is ready.
fn run_json(run: &Run, preview_domain: &str) -> serde_json::Value {
    let mut value = serde_json::to_value(run).unwrap_or_default();
    if run.status == RunStatus::Ready {
        value["publicUrl"] = json!(format!("http://{}.{}", run.id, preview_domain));
    }
    value
}
