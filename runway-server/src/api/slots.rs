//! Handlers for the slot lease endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;
use crate::allocation::{AllocationOutcome, AllocationRequest};
use crate::error::ApiError;
use crate::resets::ResetStrategy;
use crate::slots::WAITING_FOR_SLOT_REASON;

#[derive(Debug, Deserialize)]
pub struct AcquireSlotBody {
    pub run_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct AcquireSlotResponse {
    pub acquired: bool,
    pub slot_id: Option<String>,
    pub idempotent: bool,
    pub queue_reason: Option<String>,
    pub occupied_slots: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseSlotBody {
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatSlotBody {
    pub run_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AllocateSlotBody {
    pub run_id: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_seed_version")]
    pub seed_version: Option<String>,
    #[serde(default)]
    pub snapshot_version: Option<String>,
    #[serde(default)]
    pub force: bool,
}

fn default_strategy() -> String {
    "seed".to_string()
}

fn default_seed_version() -> Option<String> {
    Some("v1".to_string())
}

#[derive(Debug, Serialize)]
pub struct SlotStateResponse {
    pub slot_id: String,
    pub state: String,
    pub run_id: Option<String>,
    pub lease_state: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

pub async fn get_slots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SlotStateResponse>>, ApiError> {
    let views = state.slots.list()?;
    Ok(Json(
        views
            .into_iter()
            .map(|view| SlotStateResponse {
                slot_id: view.slot_id,
                state: view.state,
                run_id: view.run_id,
                lease_state: view.lease_state,
                expires_at: view.expires_at,
                heartbeat_at: view.heartbeat_at,
            })
            .collect(),
    ))
}

pub async fn acquire_slot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AcquireSlotBody>,
) -> Result<Json<AcquireSlotResponse>, ApiError> {
    let outcome = state.slots.acquire(&body.run_id, body.force)?;
    Ok(Json(AcquireSlotResponse {
        acquired: outcome.acquired,
        slot_id: outcome.slot_id,
        idempotent: outcome.idempotent,
        queue_reason: outcome.queue_reason,
        occupied_slots: outcome.occupied_slots,
        expires_at: outcome.expires_at,
        ttl_seconds: outcome.ttl_seconds,
    }))
}

pub async fn heartbeat_slot(
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    Json(body): Json<HeartbeatSlotBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.slots.heartbeat(&slot_id, &body.run_id)?;
    Ok(Json(json!({
        "heartbeat_updated": true,
        "slot_id": outcome.slot_id,
        "run_id": outcome.run_id,
        "expires_at": outcome.expires_at,
        "ttl_seconds": outcome.ttl_seconds,
    })))
}

pub async fn release_slot(
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<String>,
    body: Option<Json<ReleaseSlotBody>>,
) -> Result<Json<Value>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let outcome = state.slots.release(&slot_id, body.run_id.as_deref())?;
    Ok(Json(json!({
        "released": outcome.released,
        "slot_id": outcome.slot_id,
        "run_id": outcome.run_id,
    })))
}

pub async fn reap_expired(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.slots.reap_expired()?;
    Ok(Json(json!({
        "expired_count": outcome.expired_count,
        "expired_slots": outcome.expired_slots,
    })))
}

pub async fn allocate_slot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AllocateSlotBody>,
) -> Result<Json<Value>, ApiError> {
    let request = AllocationRequest {
        run_id: body.run_id,
        strategy: ResetStrategy::parse(&body.strategy)?,
        seed_version: body.seed_version,
        snapshot_version: body.snapshot_version,
        force: body.force,
    };
    let outcome = state.allocation.allocate(&request).await?;
    Ok(Json(match outcome {
        AllocationOutcome::Allocated {
            slot_id,
            branch_name,
            worktree_path,
            db_name,
        } => json!({
            "status": "allocated",
            "slot_id": slot_id,
            "branch_name": branch_name,
            "worktree_path": worktree_path,
            "db_name": db_name,
        }),
        AllocationOutcome::Waiting {
            reason,
            occupied_slots,
        } => json!({
            "status": "waiting",
            "reason": reason,
            "occupied_slots": occupied_slots,
        }),
        AllocationOutcome::Failed { reason, detail } => json!({
            "status": "failed",
            "reason": reason,
            "detail": detail,
        }),
    }))
}

pub async fn slot_contract(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "slot_ids": state.config.slot_ids,
        "lease_ttl_seconds": state.config.slot_lease_ttl_seconds,
        "acquire_behavior": {
            "all_slots_occupied": {
                "acquired": false,
                "queue_reason": WAITING_FOR_SLOT_REASON,
                "queue_behavior": "retry_on_acquire",
            },
        },
    }))
}
