//! Handlers for the worktree binding endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use runway_core::BRANCH_PREFIX;

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct AssignWorktreeBody {
    pub run_id: String,
    pub slot_id: String,
}

#[derive(Debug, Serialize)]
pub struct AssignWorktreeResponse {
    pub assigned: bool,
    pub reused: bool,
    pub slot_id: String,
    pub run_id: String,
    pub branch_name: String,
    pub worktree_path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupWorktreeBody {
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorktreeBindingResponse {
    pub slot_id: String,
    pub state: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub binding_state: Option<String>,
    pub last_action: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub async fn get_worktree_bindings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorktreeBindingResponse>>, ApiError> {
    let views = state.worktrees.list()?;
    Ok(Json(
        views
            .into_iter()
            .map(|view| WorktreeBindingResponse {
                slot_id: view.slot_id,
                state: view.state,
                run_id: view.run_id,
                branch_name: view.branch_name,
                worktree_path: view.worktree_path,
                binding_state: view.binding_state,
                last_action: view.last_action,
                updated_at: view.updated_at,
            })
            .collect(),
    ))
}

pub async fn assign_worktree(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssignWorktreeBody>,
) -> Result<Json<AssignWorktreeResponse>, ApiError> {
    let outcome = state.worktrees.assign(&body.run_id, &body.slot_id).await?;
    Ok(Json(AssignWorktreeResponse {
        assigned: outcome.assigned,
        reused: outcome.reused,
        slot_id: outcome.slot_id,
        run_id: outcome.run_id,
        branch_name: outcome.branch_name,
        worktree_path: outcome.worktree_path,
    }))
}

pub async fn cleanup_worktree(
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    body: Option<Json<CleanupWorktreeBody>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let outcome = state
        .worktrees
        .cleanup(&slot_id, body.run_id.as_deref())
        .await?;
    Ok(Json(json!({
        "cleaned": outcome.cleaned,
        "slot_id": outcome.slot_id,
        "run_id": outcome.run_id,
        "branch_name": outcome.branch_name,
        "worktree_path": outcome.worktree_path,
        "reason": outcome.reason,
    })))
}

pub async fn worktree_contract() -> Json<Value> {
    Json(json!({
        "branch_name_pattern": format!("{BRANCH_PREFIX}<run_id>"),
        "slot_binding_policy": "one_worktree_per_slot_with_persisted_binding",
        "operations": ["assign", "reuse", "cleanup"],
    }))
}
