//! Slot lease manager.
//!
//! Mediates exclusive use of the fixed preview-slot pool: at most one active
//! lease per slot, heartbeat extension, TTL expiry, and a typed waiting
//! result when the pool is saturated. There is no queue structure; a waiting
//! worker polls `acquire` with backoff, which is plenty for a pool of three.
//!
//! Every operation runs in one store transaction; the store's connection
//! mutex is the lock covering the slot-selection scan, so two racing
//! `acquire` calls cannot both win the last slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use runway_core::{ensure_transition_allowed, FailureReasonCode, RunState};

use crate::config::Config;
use crate::error::ApiError;
use crate::observability;
use crate::runs::get_run_or_not_found;
use crate::store::{AppendRunEvent, ControlStore, SlotLeaseRow, Tx};

pub const WAITING_FOR_SLOT_REASON: &str = "WAITING_FOR_SLOT";

#[derive(Debug, Clone, PartialEq)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub slot_id: Option<String>,
    pub idempotent: bool,
    pub queue_reason: Option<String>,
    pub occupied_slots: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseOutcome {
    pub released: bool,
    pub slot_id: String,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatOutcome {
    pub slot_id: String,
    pub run_id: String,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReapOutcome {
    pub expired_count: usize,
    pub expired_slots: Vec<String>,
}

/// Effective per-slot state for the list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStateView {
    pub slot_id: String,
    pub state: String,
    pub run_id: Option<String>,
    pub lease_state: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

pub struct SlotLeaseManager {
    store: Arc<ControlStore>,
    config: Arc<Config>,
}

impl SlotLeaseManager {
    pub fn new(store: Arc<ControlStore>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Reserve one free slot for the run, first-fit in configured order.
    ///
    /// A single call emits exactly one of `slot_acquired`,
    /// `slot_acquire_idempotent`, or `slot_waiting` for the requesting run.
    /// Stale leases encountered during the scan are reaped inline (their
    /// events belong to the runs that lost them).
    ///
    /// A run already recorded against a *different* slot is state drift from
    /// a crashed worker: rejected with `conflict` unless `force` is set, in
    /// which case the stale assignment is cleared first.
    pub fn acquire(&self, run_id: &str, force: bool) -> Result<AcquireOutcome, ApiError> {
        let ttl_seconds = self.config.slot_lease_ttl_seconds;
        // The closure returns a nested result so rejections commit: inline
        // reaping and rejection events must persist even when the caller
        // gets an error back.
        self.store.with_tx::<_, ApiError, _>(|tx| {
            get_run_or_not_found(tx, run_id)?;
            let now = Utc::now();
            let expiry = now + self.config.lease_ttl();

            let mut leases = tx.slot_leases_in_order(&self.config.slot_ids)?;
            for lease in &leases {
                if lease.is_stale(now) {
                    expire_lease_in_tx(tx, lease, now, "slot_acquire_ttl_reaper")?;
                }
            }
            // Re-read after inline reaping so the scan (and the drift check
            // below) see current state.
            leases = tx.slot_leases_in_order(&self.config.slot_ids)?;
            let run = get_run_or_not_found(tx, run_id)?;

            if let Some(lease) = leases
                .iter()
                .find(|lease| lease.run_id.as_deref() == Some(run_id) && lease.is_active(now))
            {
                tx.set_run_slot(run_id, Some(lease.slot_id.as_str()), now)?;
                tx.append_run_event(
                    AppendRunEvent::new(run_id, "slot_acquire_idempotent")
                        .payload(json!({
                            "slot_id": lease.slot_id,
                            "expires_at": lease.expires_at.map(|t| t.to_rfc3339()),
                        }))
                        .trace(observability::current_trace_id().as_deref()),
                    now,
                )?;
                return Ok(Ok(AcquireOutcome {
                    acquired: true,
                    slot_id: Some(lease.slot_id.clone()),
                    idempotent: true,
                    queue_reason: None,
                    occupied_slots: Vec::new(),
                    expires_at: lease.expires_at,
                    ttl_seconds,
                }));
            }

            if let Some(stale_slot) = run.slot_id.clone() {
                if !force {
                    return Ok(Err(ApiError::conflict(format!(
                        "run '{}' is already recorded against slot '{}'; \
                         pass force=true to re-acquire",
                        run_id, stale_slot
                    ))));
                }
                warn!(run_id, slot_id = %stale_slot, "forced re-acquire clears stale slot assignment");
                // Only release the lease if this run actually holds it; a
                // slot leased to someone else is left alone.
                let stale_lease = tx.get_slot_lease(&stale_slot)?;
                if stale_lease
                    .map(|lease| {
                        lease.lease_state == "leased" && lease.run_id.as_deref() == Some(run_id)
                    })
                    .unwrap_or(false)
                {
                    release_lease_in_tx(tx, &stale_slot, Some(run_id), now)?;
                }
                tx.set_run_slot(run_id, None, now)?;
            }

            let occupied: Vec<String> = leases
                .iter()
                .filter(|lease| lease.is_active(now))
                .map(|lease| lease.slot_id.clone())
                .collect();

            let selected = self
                .config
                .slot_ids
                .iter()
                .find(|slot_id| !occupied.contains(slot_id))
                .cloned();

            let Some(slot_id) = selected else {
                let mut sorted = occupied.clone();
                sorted.sort();
                tx.append_run_event(
                    AppendRunEvent::new(run_id, "slot_waiting")
                        .payload(json!({
                            "reason": WAITING_FOR_SLOT_REASON,
                            "occupied_slots": sorted,
                            "queue_behavior": "retry_on_acquire",
                        }))
                        .trace(observability::current_trace_id().as_deref()),
                    now,
                )?;
                return Ok(Ok(AcquireOutcome {
                    acquired: false,
                    slot_id: None,
                    idempotent: false,
                    queue_reason: Some(WAITING_FOR_SLOT_REASON.to_string()),
                    occupied_slots: sorted,
                    expires_at: None,
                    ttl_seconds,
                }));
            };

            tx.mark_slot_leased(&slot_id, run_id, now, expiry)?;
            tx.set_run_slot(run_id, Some(slot_id.as_str()), now)?;
            tx.append_run_event(
                AppendRunEvent::new(run_id, "slot_acquired")
                    .payload(json!({
                        "slot_id": slot_id,
                        "expires_at": expiry.to_rfc3339(),
                        "ttl_seconds": ttl_seconds,
                    }))
                    .audit("slot.acquired")
                    .trace(observability::current_trace_id().as_deref()),
                now,
            )?;
            info!(run_id, slot_id = %slot_id, "slot leased");

            Ok(Ok(AcquireOutcome {
                acquired: true,
                slot_id: Some(slot_id),
                idempotent: false,
                queue_reason: None,
                occupied_slots: Vec::new(),
                expires_at: Some(expiry),
                ttl_seconds,
            }))
        })?
    }

    /// Extend an active lease. A mismatched or expired lease is rejected with
    /// `lease_mismatch`, and an expired lease is reaped on the way out.
    pub fn heartbeat(&self, slot_id: &str, run_id: &str) -> Result<HeartbeatOutcome, ApiError> {
        let slot_id = self.validate_slot(slot_id)?;
        let ttl_seconds = self.config.slot_lease_ttl_seconds;
        // Nested result again: the rejection event (and any inline expiry)
        // must commit even though the caller sees `lease_mismatch`.
        self.store.with_tx::<_, ApiError, _>(|tx| {
            let now = Utc::now();
            let lease = tx
                .get_slot_lease(&slot_id)?
                .filter(|lease| lease.run_id.as_deref() == Some(run_id));

            let Some(lease) = lease else {
                tx.append_run_event(
                    AppendRunEvent::new(run_id, "slot_heartbeat_rejected")
                        .payload(json!({ "slot_id": slot_id, "reason": "lease_not_found" }))
                        .trace(observability::current_trace_id().as_deref()),
                    now,
                )?;
                return Ok(Err(ApiError::lease_mismatch(format!(
                    "no lease for run '{}' on slot '{}'",
                    run_id, slot_id
                ))));
            };

            if !lease.is_active(now) {
                if lease.lease_state == "leased" {
                    expire_lease_in_tx(tx, &lease, now, "slot_heartbeat")?;
                }
                tx.append_run_event(
                    AppendRunEvent::new(run_id, "slot_heartbeat_rejected")
                        .payload(json!({ "slot_id": slot_id, "reason": "lease_expired" }))
                        .trace(observability::current_trace_id().as_deref()),
                    now,
                )?;
                return Ok(Err(ApiError::lease_mismatch(format!(
                    "lease for run '{}' on slot '{}' has expired",
                    run_id, slot_id
                ))));
            }

            let expiry = now + self.config.lease_ttl();
            tx.touch_slot_heartbeat(&slot_id, now, expiry)?;
            tx.append_run_event(
                AppendRunEvent::new(run_id, "slot_heartbeat")
                    .payload(json!({
                        "slot_id": slot_id,
                        "expires_at": expiry.to_rfc3339(),
                        "ttl_seconds": ttl_seconds,
                    }))
                    .trace(observability::current_trace_id().as_deref()),
                now,
            )?;

            Ok(Ok(HeartbeatOutcome {
                slot_id: slot_id.clone(),
                run_id: run_id.to_string(),
                expires_at: expiry,
                ttl_seconds,
            }))
        })?
    }

    /// Release a lease. Idempotent when already released; releasing a slot
    /// owned by a different run is `lease_mismatch`.
    pub fn release(&self, slot_id: &str, run_id: Option<&str>) -> Result<ReleaseOutcome, ApiError> {
        let slot_id = self.validate_slot(slot_id)?;
        self.store
            .with_tx(|tx| release_lease_in_tx(tx, &slot_id, run_id, Utc::now()))
    }

    /// Expire every stale lease. The authoritative timeout enforcement; an
    /// external scheduler calls this periodically.
    pub fn reap_expired(&self) -> Result<ReapOutcome, ApiError> {
        self.store.with_tx(|tx| {
            let now = Utc::now();
            let mut expired_slots = Vec::new();
            for lease in tx.leased_slot_rows()? {
                if lease.is_stale(now) {
                    expire_lease_in_tx(tx, &lease, now, "slot_reaper")?;
                    expired_slots.push(lease.slot_id.clone());
                }
            }
            expired_slots.sort();
            Ok(ReapOutcome {
                expired_count: expired_slots.len(),
                expired_slots,
            })
        })
    }

    /// Per-slot state in configured order; a stale `leased` row reads as
    /// `expired` without being mutated.
    pub fn list(&self) -> Result<Vec<SlotStateView>, ApiError> {
        self.store.with_tx(|tx| {
            let now = Utc::now();
            let leases = tx.slot_leases_in_order(&self.config.slot_ids)?;
            Ok(leases
                .into_iter()
                .map(|lease| {
                    let effective = if lease.lease_state == "leased" && !lease.is_active(now) {
                        "expired"
                    } else {
                        lease.lease_state.as_str()
                    };
                    SlotStateView {
                        state: effective.to_string(),
                        lease_state: Some(lease.lease_state.clone()),
                        slot_id: lease.slot_id,
                        run_id: lease.run_id,
                        expires_at: lease.expires_at,
                        heartbeat_at: lease.heartbeat_at,
                    }
                })
                .collect())
        })
    }

    fn validate_slot(&self, slot_id: &str) -> Result<String, ApiError> {
        let canonical = runway_core::normalize_slot_id(slot_id)?;
        if !self.config.slot_ids.contains(&canonical) {
            return Err(ApiError::validation(format!(
                "slot '{}' is not in the configured pool",
                slot_id
            )));
        }
        Ok(canonical)
    }
}

/// Release the slot only if this run still holds its lease; drift (the lease
/// moved on to another run, or is already gone) is recorded as a skip event
/// instead of failing the caller's operation. Used by cancellation, expiry,
/// and the merge gate, which must all complete regardless of lease state.
pub(crate) fn release_lease_if_held(
    tx: &Tx<'_>,
    slot_id: &str,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    let held = tx
        .get_slot_lease(slot_id)?
        .map(|lease| lease.lease_state == "leased" && lease.run_id.as_deref() == Some(run_id))
        .unwrap_or(false);
    if held {
        release_lease_in_tx(tx, slot_id, Some(run_id), now)?;
        return Ok(true);
    }
    tx.append_run_event(
        AppendRunEvent::new(run_id, "slot_release_skipped")
            .payload(json!({ "slot_id": slot_id, "reason": "lease_not_held" }))
            .trace(observability::current_trace_id().as_deref()),
        now,
    )?;
    Ok(false)
}

/// Release a lease inside an existing transaction, clearing `Run.slot_id`
/// atomically. Shared with run cancellation and the merge gate.
pub(crate) fn release_lease_in_tx(
    tx: &Tx<'_>,
    slot_id: &str,
    run_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ReleaseOutcome, ApiError> {
    tx.ensure_slot_lease_row(slot_id)?;
    let lease = tx
        .get_slot_lease(slot_id)?
        .ok_or_else(|| ApiError::internal("slot lease row vanished"))?;

    if lease.lease_state != "leased" {
        return Ok(ReleaseOutcome {
            released: true,
            slot_id: slot_id.to_string(),
            run_id: None,
        });
    }

    if let (Some(expected), Some(actual)) = (run_id, lease.run_id.as_deref()) {
        if expected != actual {
            return Err(ApiError::lease_mismatch(format!(
                "slot '{}' is leased by run '{}', not '{}'",
                slot_id, actual, expected
            )));
        }
    }

    let owning_run = lease.run_id.clone();
    tx.mark_slot_released(slot_id, now)?;
    if let Some(owner) = &owning_run {
        if let Some(run) = tx.get_run(owner)? {
            if run.slot_id.as_deref() == Some(slot_id) {
                tx.set_run_slot(owner, None, now)?;
            }
        }
        tx.append_run_event(
            AppendRunEvent::new(owner, "slot_released")
                .payload(json!({ "slot_id": slot_id }))
                .audit("slot.released")
                .trace(observability::current_trace_id().as_deref()),
            now,
        )?;
    }

    Ok(ReleaseOutcome {
        released: true,
        slot_id: slot_id.to_string(),
        run_id: owning_run,
    })
}

/// Expire a stale lease and drive the owning run's expiry transition,
/// recording why when the transition cannot legally happen.
pub(crate) fn expire_lease_in_tx(
    tx: &Tx<'_>,
    lease: &SlotLeaseRow,
    now: DateTime<Utc>,
    source: &str,
) -> Result<(), ApiError> {
    tx.mark_slot_expired(&lease.slot_id, now)?;

    let Some(run_id) = lease.run_id.clone() else {
        return Ok(());
    };

    if let Some(run) = tx.get_run(&run_id)? {
        if run.slot_id.as_deref() == Some(lease.slot_id.as_str()) {
            tx.set_run_slot(&run_id, None, now)?;
        }
        mark_run_expired_for_slot_ttl(tx, &run.id, run.status, &lease.slot_id, source, now)?;
    }

    tx.append_run_event(
        AppendRunEvent::new(&run_id, "slot_expired")
            .payload(json!({
                "slot_id": lease.slot_id,
                "reason": FailureReasonCode::PreviewExpired.as_str(),
                "source": source,
            }))
            .audit("slot.expired")
            .trace(observability::current_trace_id().as_deref()),
        now,
    )?;
    warn!(run_id, slot_id = %lease.slot_id, source, "slot lease expired");

    Ok(())
}

/// TTL expiry policy: the run moves to `expired` (not `failed`); the event
/// payload carries the `PREVIEW_EXPIRED` code and recovery hints. Runs whose
/// current state cannot legally expire get a skip event instead.
fn mark_run_expired_for_slot_ttl(
    tx: &Tx<'_>,
    run_id: &str,
    current: RunState,
    slot_id: &str,
    source: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    if current == RunState::Expired {
        return Ok(());
    }
    if ensure_transition_allowed(current, RunState::Expired, None).is_err() {
        tx.append_run_event(
            AppendRunEvent::new(run_id, "slot_expiry_transition_skipped")
                .payload(json!({
                    "slot_id": slot_id,
                    "source": source,
                    "run_status": current.as_str(),
                    "reason": "invalid_transition",
                }))
                .trace(observability::current_trace_id().as_deref()),
            now,
        )?;
        return Ok(());
    }

    tx.update_run_status(run_id, RunState::Expired, now)?;
    tx.append_run_event(
        AppendRunEvent::new(run_id, "status_transition")
            .status(Some(current), Some(RunState::Expired))
            .payload(json!({
                "source": source,
                "reason": FailureReasonCode::PreviewExpired.as_str(),
                "failure_reason_code": FailureReasonCode::PreviewExpired.as_str(),
                "recoverable": true,
                "recovery_strategy": "create_child_run",
                "resume_endpoint": format!("/api/runs/{}/resume", run_id),
                "slot_id": slot_id,
            }))
            .audit("run.expired")
            .trace(observability::current_trace_id().as_deref()),
        now,
    )?;
    Ok(())
}
