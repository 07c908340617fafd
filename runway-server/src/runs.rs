//! Run lifecycle service.
//!
//! Sole authority for `Run.status`. Everything that wants to move a run
//! (the API, the lease reaper, the merge gate) funnels through
//! [`apply_transition`], which validates against the transition table,
//! writes the status, and appends the `status_transition` event and its
//! audit mirror in the same transaction.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use runway_core::{ensure_transition_allowed, FailureReasonCode, RunState};

use crate::error::ApiError;
use crate::observability;
use crate::slots::release_lease_if_held;
use crate::store::{
    failure_payload, AppendRunEvent, ControlStore, NewRun, RunContextRow, RunFilter, RunRow, Tx,
};
use crate::worktrees::WorktreeManager;

/// A run plus its context, as returned by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct RunWithContext {
    pub run: RunRow,
    pub context: Option<RunContextRow>,
}

#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub title: String,
    pub prompt: String,
    pub route: Option<String>,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub to_status: RunState,
    pub failure_reason_code: Option<FailureReasonCode>,
    pub payload: Option<Value>,
    pub actor: Option<String>,
}

pub struct RunService {
    store: Arc<ControlStore>,
    worktrees: Arc<WorktreeManager>,
}

impl RunService {
    pub fn new(store: Arc<ControlStore>, worktrees: Arc<WorktreeManager>) -> Self {
        Self { store, worktrees }
    }

    /// Create a run in `queued` with its context row and `run_created` event.
    pub fn create(&self, request: CreateRunRequest) -> Result<RunWithContext, ApiError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let trace_id = observability::current_trace_id();

        // The inbound trace id rides along in the context metadata so later
        // phases of the run can correlate with the original submission.
        let metadata = match (request.metadata.clone(), &trace_id) {
            (Some(Value::Object(mut map)), Some(trace)) => {
                map.entry("trace_id".to_string())
                    .or_insert_with(|| Value::String(trace.clone()));
                Some(Value::Object(map))
            }
            (Some(other), _) => Some(other),
            (None, Some(trace)) => Some(json!({ "trace_id": trace })),
            (None, None) => None,
        };

        self.store.with_tx(|tx| {
            let now = Utc::now();
            let run = tx.insert_run(
                &NewRun {
                    id: run_id.clone(),
                    title: request.title.clone(),
                    prompt: request.prompt.clone(),
                    route: request.route.clone(),
                    created_by: request.created_by.clone(),
                    parent_run_id: None,
                },
                now,
            )?;
            let context = RunContextRow {
                run_id: run.id.clone(),
                route: request.route.clone(),
                page_title: request.page_title.clone(),
                element_hint: request.element_hint.clone(),
                note: request.note.clone(),
                metadata,
            };
            tx.insert_run_context(&context)?;
            tx.append_run_event(
                AppendRunEvent::new(&run.id, "run_created")
                    .status(None, Some(RunState::Queued))
                    .payload(json!({
                        "source": "api",
                        "context": {
                            "route": request.route,
                            "note": request.note,
                        },
                    }))
                    .actor(request.created_by.as_deref())
                    .audit("run.created")
                    .trace(trace_id.as_deref()),
                now,
            )?;
            info!(run_id = %run.id, "run created");
            Ok(RunWithContext {
                run,
                context: Some(context),
            })
        })
    }

    pub fn get(&self, run_id: &str) -> Result<RunWithContext, ApiError> {
        self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            let context = tx.get_run_context(run_id)?;
            Ok(RunWithContext { run, context })
        })
    }

    pub fn list(&self, filter: &RunFilter) -> Result<(Vec<RunWithContext>, u64), ApiError> {
        self.store.with_tx(|tx| {
            let (runs, total) = tx.list_runs(filter)?;
            let mut items = Vec::with_capacity(runs.len());
            for run in runs {
                let context = tx.get_run_context(&run.id)?;
                items.push(RunWithContext { run, context });
            }
            Ok((items, total))
        })
    }

    /// Apply a caller-requested transition.
    pub fn transition(
        &self,
        run_id: &str,
        request: &TransitionRequest,
    ) -> Result<RunRow, ApiError> {
        self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            apply_transition(
                tx,
                &run,
                request.to_status,
                request.failure_reason_code,
                request.payload.clone(),
                request.actor.as_deref(),
                "run.transition",
            )
        })
    }

    /// Cancel from any non-terminal state, force-releasing the slot lease and
    /// then attempting a non-force worktree cleanup.
    pub async fn cancel(
        &self,
        run_id: &str,
        reason: Option<&str>,
        actor: Option<&str>,
    ) -> Result<RunRow, ApiError> {
        let held_slot = self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            let updated = apply_transition(
                tx,
                &run,
                RunState::Canceled,
                None,
                Some(json!({ "source": "cancel_endpoint", "reason": reason })),
                actor,
                "run.canceled",
            )?;
            let held_slot = updated.slot_id.clone();
            if let Some(slot_id) = &held_slot {
                // Must complete even if the worker holding the slot is gone.
                release_lease_if_held(tx, slot_id, run_id, Utc::now())?;
            }
            Ok::<_, ApiError>(held_slot)
        })?;

        if let Some(slot_id) = held_slot {
            match self.worktrees.cleanup(&slot_id, Some(run_id)).await {
                Ok(_) => {}
                Err(err) => {
                    // Cleanup failure never un-cancels the run; record it.
                    self.store.with_tx(|tx| {
                        tx.append_run_event(
                            AppendRunEvent::new(run_id, "worktree_cleanup_failed")
                                .payload(json!({
                                    "slot_id": slot_id,
                                    "source": "cancel_endpoint",
                                    "error": err.to_string(),
                                }))
                                .actor(actor)
                                .trace(observability::current_trace_id().as_deref()),
                            Utc::now(),
                        )?;
                        Ok::<_, ApiError>(())
                    })?;
                }
            }
        }

        Ok(self.store.with_tx(|tx| get_run_or_not_found(tx, run_id))?)
    }

    /// Force the run to `expired` through the normal rules, releasing any
    /// held lease. The worktree is left on disk for inspection.
    pub fn expire(&self, run_id: &str, actor: Option<&str>) -> Result<RunRow, ApiError> {
        self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            let updated = apply_transition(
                tx,
                &run,
                RunState::Expired,
                None,
                Some(json!({
                    "source": "expire_endpoint",
                    "reason": FailureReasonCode::PreviewExpired.as_str(),
                    "failure_reason_code": FailureReasonCode::PreviewExpired.as_str(),
                })),
                actor,
                "run.expired",
            )?;
            if let Some(slot_id) = &updated.slot_id {
                release_lease_if_held(tx, slot_id, run_id, Utc::now())?;
            }
            get_run_or_not_found(tx, run_id)
        })
    }

    /// Create a child run in `queued` copying the parent's prompt and
    /// context. Only `failed` and `expired` parents can be retried.
    pub fn retry(&self, run_id: &str, actor: Option<&str>) -> Result<RunWithContext, ApiError> {
        self.fork(run_id, actor, "Retry", "run_retried", "run.retried")
    }

    /// Operator-facing recovery for expired runs; identical mechanics to
    /// retry but recorded as `run_resumed`.
    pub fn resume(&self, run_id: &str, actor: Option<&str>) -> Result<RunWithContext, ApiError> {
        self.fork(run_id, actor, "Resume", "run_resumed", "run.resumed")
    }

    fn fork(
        &self,
        run_id: &str,
        actor: Option<&str>,
        title_prefix: &str,
        event_type: &str,
        audit_action: &str,
    ) -> Result<RunWithContext, ApiError> {
        let child_id = uuid::Uuid::new_v4().to_string();
        let trace_id = observability::current_trace_id();
        self.store.with_tx(|tx| {
            let parent = get_run_or_not_found(tx, run_id)?;
            if !matches!(parent.status, RunState::Failed | RunState::Expired) {
                return Err(ApiError::conflict(format!(
                    "run '{}' is '{}'; only failed or expired runs can be retried",
                    parent.id, parent.status
                )));
            }
            let parent_context = tx.get_run_context(&parent.id)?;

            let now = Utc::now();
            let child = tx.insert_run(
                &NewRun {
                    id: child_id.clone(),
                    title: format!("{}: {}", title_prefix, parent.title),
                    prompt: parent.prompt.clone(),
                    route: parent.route.clone(),
                    created_by: parent.created_by.clone(),
                    parent_run_id: Some(parent.id.clone()),
                },
                now,
            )?;
            let context = RunContextRow {
                run_id: child.id.clone(),
                route: parent_context
                    .as_ref()
                    .and_then(|c| c.route.clone())
                    .or_else(|| parent.route.clone()),
                page_title: parent_context.as_ref().and_then(|c| c.page_title.clone()),
                element_hint: parent_context.as_ref().and_then(|c| c.element_hint.clone()),
                note: parent_context.as_ref().and_then(|c| c.note.clone()),
                metadata: parent_context.as_ref().and_then(|c| c.metadata.clone()),
            };
            tx.insert_run_context(&context)?;
            tx.append_run_event(
                AppendRunEvent::new(&child.id, event_type)
                    .status(None, Some(RunState::Queued))
                    .payload(json!({ "parent_run_id": parent.id }))
                    .actor(actor)
                    .audit(audit_action)
                    .trace(trace_id.as_deref()),
                now,
            )?;
            Ok(RunWithContext {
                run: child,
                context: Some(context),
            })
        })
    }
}

pub(crate) fn get_run_or_not_found(tx: &Tx<'_>, run_id: &str) -> Result<RunRow, ApiError> {
    tx.get_run(run_id)?
        .ok_or_else(|| ApiError::not_found(format!("run '{}' not found", run_id)))
}

/// Validate and apply one status change, appending the transition event and
/// audit entry. Returns the updated run.
pub(crate) fn apply_transition(
    tx: &Tx<'_>,
    run: &RunRow,
    target: RunState,
    failure_reason: Option<FailureReasonCode>,
    payload: Option<Value>,
    actor: Option<&str>,
    audit_action: &str,
) -> Result<RunRow, ApiError> {
    ensure_transition_allowed(run.status, target, failure_reason)?;

    let now = Utc::now();
    tx.update_run_status(&run.id, target, now)?;

    let event_payload = match failure_reason {
        Some(code) => failure_payload(code, payload),
        None => payload.unwrap_or_else(|| json!({})),
    };
    tx.append_run_event(
        AppendRunEvent::new(&run.id, "status_transition")
            .status(Some(run.status), Some(target))
            .payload(event_payload)
            .actor(actor)
            .audit(audit_action)
            .trace(observability::current_trace_id().as_deref()),
        now,
    )?;

    info!(run_id = %run.id, from = %run.status, to = %target, "run transitioned");
    get_run_or_not_found(tx, &run.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::drivers::mock::MockGitDriver;
    use crate::error::ErrorKind;
    use crate::slots::SlotLeaseManager;

    fn service() -> (RunService, Arc<ControlStore>, Arc<SlotLeaseManager>) {
        let store = Arc::new(ControlStore::open_in_memory().expect("store"));
        let config = Arc::new(Config::for_tests());
        store.ensure_slot_rows(&config.slot_ids).expect("seed slots");
        let worktrees = Arc::new(WorktreeManager::new(
            store.clone(),
            config.clone(),
            Arc::new(MockGitDriver::new()),
        ));
        let slots = Arc::new(SlotLeaseManager::new(store.clone(), config));
        (RunService::new(store.clone(), worktrees), store, slots)
    }

    fn create_request(title: &str) -> CreateRunRequest {
        CreateRunRequest {
            title: title.to_string(),
            prompt: "add link".to_string(),
            route: Some("/codex".to_string()),
            page_title: None,
            element_hint: None,
            note: None,
            metadata: None,
            created_by: None,
        }
    }

    #[test]
    fn test_create_starts_queued_with_event() {
        let (service, store, _) = service();
        let created = service.create(create_request("First")).unwrap();
        assert_eq!(created.run.status, RunState::Queued);
        assert!(created.context.is_some());

        let events = store
            .with_tx::<_, ApiError, _>(|tx| Ok(tx.list_run_events(&created.run.id, 10)?))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run_created");
        assert_eq!(events[0].status_to.as_deref(), Some("queued"));
    }

    #[test]
    fn test_transition_happy_step() {
        let (service, store, _) = service();
        let run = service.create(create_request("First")).unwrap().run;

        let updated = service
            .transition(
                &run.id,
                &TransitionRequest {
                    to_status: RunState::Planning,
                    failure_reason_code: None,
                    payload: None,
                    actor: None,
                },
            )
            .unwrap();
        assert_eq!(updated.status, RunState::Planning);

        let events = store
            .with_tx::<_, ApiError, _>(|tx| Ok(tx.list_run_events(&run.id, 10)?))
            .unwrap();
        let transition = events.last().unwrap();
        assert_eq!(transition.event_type, "status_transition");
        assert_eq!(transition.status_from.as_deref(), Some("queued"));
        assert_eq!(transition.status_to.as_deref(), Some("planning"));
    }

    #[test]
    fn test_invalid_transition_leaves_run_untouched() {
        let (service, store, _) = service();
        let run = service.create(create_request("First")).unwrap().run;

        let err = service
            .transition(
                &run.id,
                &TransitionRequest {
                    to_status: RunState::Deploying,
                    failure_reason_code: None,
                    payload: None,
                    actor: None,
                },
            )
            .expect_err("queued -> deploying must be rejected");
        assert_eq!(err.kind, ErrorKind::Conflict);

        let reloaded = service.get(&run.id).unwrap().run;
        assert_eq!(reloaded.status, RunState::Queued);

        // No status_transition event was appended for the rejected request.
        let events = store
            .with_tx::<_, ApiError, _>(|tx| Ok(tx.list_run_events(&run.id, 10)?))
            .unwrap();
        assert!(events.iter().all(|e| e.event_type != "status_transition"));
    }

    #[test]
    fn test_failed_transition_requires_code_and_stamps_payload() {
        let (service, store, _) = service();
        let run = service.create(create_request("First")).unwrap().run;

        let err = service
            .transition(
                &run.id,
                &TransitionRequest {
                    to_status: RunState::Failed,
                    failure_reason_code: None,
                    payload: None,
                    actor: None,
                },
            )
            .expect_err("failed without code must be rejected");
        assert_eq!(err.kind, ErrorKind::Validation);

        service
            .transition(
                &run.id,
                &TransitionRequest {
                    to_status: RunState::Failed,
                    failure_reason_code: Some(FailureReasonCode::ValidationFailed),
                    payload: None,
                    actor: None,
                },
            )
            .unwrap();

        let events = store
            .with_tx::<_, ApiError, _>(|tx| Ok(tx.list_run_events(&run.id, 10)?))
            .unwrap();
        let transition = events.last().unwrap();
        assert_eq!(
            transition.payload.as_ref().unwrap()["failure_reason_code"],
            json!("VALIDATION_FAILED")
        );
    }

    #[test]
    fn test_terminal_runs_never_move_again() {
        let (service, _, _) = service();
        let run = service.create(create_request("First")).unwrap().run;
        service
            .transition(
                &run.id,
                &TransitionRequest {
                    to_status: RunState::Failed,
                    failure_reason_code: Some(FailureReasonCode::UnknownError),
                    payload: None,
                    actor: None,
                },
            )
            .unwrap();

        for target in RunState::ALL {
            let err = service
                .transition(
                    &run.id,
                    &TransitionRequest {
                        to_status: target,
                        failure_reason_code: (target == RunState::Failed)
                            .then_some(FailureReasonCode::UnknownError),
                        payload: None,
                        actor: None,
                    },
                )
                .expect_err("terminal run must reject transitions");
            assert_eq!(err.kind, ErrorKind::Conflict);
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_lease() {
        let (service, store, slots) = service();
        let run = service.create(create_request("First")).unwrap().run;
        let acquired = slots.acquire(&run.id, false).unwrap();
        let slot_id = acquired.slot_id.expect("slot acquired");

        let canceled = service.cancel(&run.id, Some("operator"), None).await.unwrap();
        assert_eq!(canceled.status, RunState::Canceled);
        assert!(canceled.slot_id.is_none());

        let lease = store
            .with_tx::<_, ApiError, _>(|tx| Ok(tx.get_slot_lease(&slot_id)?))
            .unwrap()
            .unwrap();
        assert_eq!(lease.lease_state, "released");
        assert!(lease.run_id.is_none());
    }

    #[test]
    fn test_retry_only_from_failed_or_expired() {
        let (service, _, _) = service();
        let run = service.create(create_request("First")).unwrap().run;

        let err = service.retry(&run.id, None).expect_err("queued run cannot retry");
        assert_eq!(err.kind, ErrorKind::Conflict);

        service
            .transition(
                &run.id,
                &TransitionRequest {
                    to_status: RunState::Failed,
                    failure_reason_code: Some(FailureReasonCode::AgentTimeout),
                    payload: None,
                    actor: None,
                },
            )
            .unwrap();

        let child = service.retry(&run.id, None).unwrap();
        assert_eq!(child.run.status, RunState::Queued);
        assert_eq!(child.run.parent_run_id.as_deref(), Some(run.id.as_str()));
        assert!(child.run.title.starts_with("Retry: "));
        assert_eq!(child.run.prompt, run.prompt);

        // Parent untouched.
        let parent = service.get(&run.id).unwrap().run;
        assert_eq!(parent.status, RunState::Failed);
    }

    #[test]
    fn test_expire_endpoint_conflicts_while_merging() {
        let (service, store, _) = service();
        let run = service.create(create_request("First")).unwrap().run;
        // Walk to merging.
        for target in [
            RunState::Planning,
            RunState::Editing,
            RunState::Testing,
            RunState::PreviewReady,
            RunState::NeedsApproval,
            RunState::Approved,
            RunState::Merging,
        ] {
            service
                .transition(
                    &run.id,
                    &TransitionRequest {
                        to_status: target,
                        failure_reason_code: None,
                        payload: None,
                        actor: None,
                    },
                )
                .unwrap();
        }

        let err = service.expire(&run.id, None).expect_err("merging cannot expire");
        assert_eq!(err.kind, ErrorKind::Conflict);
        let reloaded = store
            .with_tx::<_, ApiError, _>(|tx| Ok(tx.get_run(&run.id)?))
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, RunState::Merging);
    }
}
