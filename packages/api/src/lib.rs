// ABOUTME: HTTP API layer for the arena orchestrator providing REST endpoints and routing
// ABOUTME: Integration layer over the orchestrator domain crate

use arena_orchestrator::{GatewayRegistry, LifecycleEngine, RunStore};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use std::sync::Arc;

pub mod handlers;
pub mod response;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RunStore>,
    pub engine: Arc<LifecycleEngine>,
    pub gateway: Arc<GatewayRegistry>,
    /// Domain the reverse proxy serves previews under, for derived publicUrl.
    pub preview_domain: String,
}

/// Creates the full orchestrator router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}/start", post(handlers::start_session))
        .route("/api/runs/{id}", get(handlers::get_run))
        .route("/api/runs/{id}", patch(handlers::patch_run))
        .route("/api/runs/{id}", delete(handlers::delete_run))
        .route("/api/runs/{id}/start", post(handlers::start_run))
        .route("/api/runs/{id}/logs", get(handlers::get_run_logs))
        .route("/gateway/resolve/{id}", get(handlers::resolve))
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .with_state(state)
}
