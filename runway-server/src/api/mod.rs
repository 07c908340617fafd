//! Control HTTP API.
//!
//! Thin JSON skins over the services. Handlers parse and validate input,
//! call exactly one service operation, and map its typed result (or
//! `ApiError`) onto the wire. The trace middleware scopes every request with
//! the inbound `X-Trace-Id` (or a generated one) so events, audit entries,
//! and spawned driver commands all correlate.

mod releases;
mod runs;
mod slots;
mod worktrees;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use runway_core::ensure_trace_id;

use crate::allocation::AllocationOrchestrator;
use crate::config::Config;
use crate::merge_gate::MergeGate;
use crate::observability;
use crate::resets::ResetCoordinator;
use crate::runs::RunService;
use crate::slots::SlotLeaseManager;
use crate::store::ControlStore;
use crate::worktrees::WorktreeManager;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ControlStore>,
    pub runs: RunService,
    pub slots: Arc<SlotLeaseManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub resets: Arc<ResetCoordinator>,
    pub allocation: AllocationOrchestrator,
    pub merge_gate: MergeGate,
}

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "runway",
    })))
}

/// Scope the request with a trace id from the configured header, generating
/// one when absent.
async fn trace_scope(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let inbound = request
        .headers()
        .get(state.config.trace_header_name.as_str())
        .and_then(|value| value.to_str().ok());
    let trace_id = ensure_trace_id(inbound);
    observability::with_trace_id(Some(trace_id), next.run(request)).await
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/runs", post(runs::create_run).get(runs::list_runs))
        .route("/api/runs/contract", get(runs::run_contract))
        .route("/api/runs/:run_id", get(runs::get_run))
        .route("/api/runs/:run_id/transition", post(runs::transition_run))
        .route("/api/runs/:run_id/cancel", post(runs::cancel_run))
        .route("/api/runs/:run_id/retry", post(runs::retry_run))
        .route("/api/runs/:run_id/resume", post(runs::resume_run))
        .route("/api/runs/:run_id/expire", post(runs::expire_run))
        .route("/api/runs/:run_id/events", get(runs::list_run_events))
        .route("/api/runs/:run_id/checks", get(runs::list_run_checks))
        .route("/api/runs/:run_id/artifacts", get(runs::list_run_artifacts))
        .route("/api/runs/:run_id/approvals", get(runs::list_run_approvals))
        .route("/api/runs/:run_id/approve", post(runs::approve_run))
        .route("/api/runs/:run_id/reject", post(runs::reject_run))
        .route("/api/slots", get(slots::get_slots))
        .route("/api/slots/contract", get(slots::slot_contract))
        .route("/api/slots/acquire", post(slots::acquire_slot))
        .route("/api/slots/allocate", post(slots::allocate_slot))
        .route("/api/slots/reap-expired", post(slots::reap_expired))
        .route("/api/slots/:slot_id/heartbeat", post(slots::heartbeat_slot))
        .route("/api/slots/:slot_id/release", post(slots::release_slot))
        .route("/api/worktrees", get(worktrees::get_worktree_bindings))
        .route("/api/worktrees/contract", get(worktrees::worktree_contract))
        .route("/api/worktrees/assign", post(worktrees::assign_worktree))
        .route(
            "/api/worktrees/:slot_id/cleanup",
            post(worktrees::cleanup_worktree),
        )
        .route("/api/releases", get(releases::get_releases))
        .route("/api/releases/:release_id", get(releases::get_release))
        .layer(middleware::from_fn_with_state(state.clone(), trace_scope))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
