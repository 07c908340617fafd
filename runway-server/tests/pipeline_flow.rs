//! End-to-end pipeline flow against the services with scripted drivers:
//! submit → allocate (lease + worktree + preview DB) → agent phases →
//! approval → merge gate → deployed release, plus the saturation and
//! expiry-recovery paths around it.

use std::sync::Arc;

use chrono::Utc;

use runway_core::{FailureReasonCode, RunState};
use runway_server::allocation::{AllocationOrchestrator, AllocationOutcome, AllocationRequest};
use runway_server::config::Config;
use runway_server::drivers::mock::{
    MockCheckRunner, MockDbResetDriver, MockDeployDriver, MockGitDriver, MockHealthProbe,
};
use runway_server::error::ApiError;
use runway_server::merge_gate::{ApproveRequest, MergeGate};
use runway_server::resets::{ResetCoordinator, ResetStrategy};
use runway_server::runs::{CreateRunRequest, RunService, TransitionRequest};
use runway_server::slots::SlotLeaseManager;
use runway_server::store::ControlStore;
use runway_server::worktrees::WorktreeManager;

struct Harness {
    store: Arc<ControlStore>,
    runs: RunService,
    slots: Arc<SlotLeaseManager>,
    allocation: AllocationOrchestrator,
    gate: MergeGate,
    git: Arc<MockGitDriver>,
    deploy: Arc<MockDeployDriver>,
    _artifacts: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let artifacts = tempfile::tempdir().expect("tempdir");
    let mut config = Config::for_tests();
    config.artifact_root = artifacts.path().to_path_buf();
    tweak(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(ControlStore::open_in_memory().expect("store"));
    store.ensure_slot_rows(&config.slot_ids).expect("seed slots");

    let git = Arc::new(MockGitDriver::new());
    let db = Arc::new(MockDbResetDriver::new());
    let deploy = Arc::new(MockDeployDriver::with_current("genesis"));
    let health = Arc::new(MockHealthProbe::new());
    let checks = Arc::new(MockCheckRunner::new());

    let worktrees = Arc::new(WorktreeManager::new(
        store.clone(),
        config.clone(),
        git.clone(),
    ));
    let slots = Arc::new(SlotLeaseManager::new(store.clone(), config.clone()));
    let resets = Arc::new(ResetCoordinator::new(store.clone(), config.clone(), db));
    let allocation =
        AllocationOrchestrator::new(slots.clone(), worktrees.clone(), resets.clone());
    let gate = MergeGate::new(
        store.clone(),
        config.clone(),
        git.clone(),
        deploy.clone(),
        health,
        checks,
        worktrees.clone(),
    );
    let runs = RunService::new(store.clone(), worktrees);

    Harness {
        store,
        runs,
        slots,
        allocation,
        gate,
        git,
        deploy,
        _artifacts: artifacts,
    }
}

fn submit(harness: &Harness, title: &str) -> String {
    harness
        .runs
        .create(CreateRunRequest {
            title: title.to_string(),
            prompt: "add link".to_string(),
            route: Some("/codex".to_string()),
            page_title: None,
            element_hint: None,
            note: None,
            metadata: None,
            created_by: Some("user-1".to_string()),
        })
        .expect("create run")
        .run
        .id
}

async fn allocate(harness: &Harness, run_id: &str) -> AllocationOutcome {
    harness
        .allocation
        .allocate(&AllocationRequest {
            run_id: run_id.to_string(),
            strategy: ResetStrategy::Seed,
            seed_version: Some("v1".to_string()),
            snapshot_version: None,
            force: false,
        })
        .await
        .expect("allocate")
}

fn drive_to(harness: &Harness, run_id: &str, targets: &[RunState]) {
    for target in targets {
        harness
            .runs
            .transition(
                run_id,
                &TransitionRequest {
                    to_status: *target,
                    failure_reason_code: None,
                    payload: None,
                    actor: None,
                },
            )
            .unwrap_or_else(|e| panic!("transition to {target} failed: {e}"));
    }
}

fn run_state(harness: &Harness, run_id: &str) -> RunState {
    harness.runs.get(run_id).expect("get run").run.status
}

#[tokio::test]
async fn happy_path_single_run_reaches_deployed_release() {
    let harness = harness();
    let run_id = submit(&harness, "Add footer link");
    assert_eq!(run_state(&harness, &run_id), RunState::Queued);

    // Worker claims the run and gets a fully prepared slot.
    let allocated = allocate(&harness, &run_id).await;
    let AllocationOutcome::Allocated {
        slot_id,
        branch_name,
        worktree_path,
        db_name,
    } = allocated
    else {
        panic!("expected allocation, got {allocated:?}");
    };
    assert_eq!(slot_id, "preview-1");
    assert_eq!(branch_name, format!("codex/run-{run_id}"));
    assert!(worktree_path.ends_with("preview-1"));
    assert_eq!(db_name, "app_preview_1");

    // Reset provenance exists with the slot's database.
    let resets = harness
        .store
        .with_tx::<_, ApiError, _>(|tx| Ok(tx.list_preview_db_resets_for_run(&run_id)?))
        .unwrap();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].reset_status, "applied");
    assert_eq!(resets[0].db_name, "app_preview_1");

    // The agent works the run through its phases; the worker records the
    // commit the preview was built from.
    drive_to(
        &harness,
        &run_id,
        &[
            RunState::Planning,
            RunState::Editing,
            RunState::Testing,
            RunState::PreviewReady,
            RunState::NeedsApproval,
        ],
    );
    harness
        .store
        .with_tx::<_, ApiError, _>(|tx| {
            tx.set_run_commit_sha(&run_id, "feedbeef", Utc::now())?;
            Ok(())
        })
        .unwrap();

    // Human approves; the merge gate takes it all the way to merged.
    let approval = harness
        .gate
        .approve(
            &run_id,
            &ApproveRequest {
                reviewer_id: Some("reviewer-1".to_string()),
                reason: Some("looks good".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(approval.decision, "approved");

    let run = harness.runs.get(&run_id).unwrap().run;
    assert_eq!(run.status, RunState::Merged);
    assert_eq!(run.commit_sha.as_deref(), Some("mergedsha"));

    // Release registry: new release deployed, bootstrap release untouched
    // (it was never recorded as deployed in the registry).
    let release = harness.gate.get_release("mergedsha").unwrap();
    assert_eq!(release.status, "deployed");
    assert!(release.deployed_at.is_some());

    // The slot and worktree went back to the pool.
    let lease = harness
        .store
        .with_tx::<_, ApiError, _>(|tx| Ok(tx.get_slot_lease("preview-1")?))
        .unwrap()
        .unwrap();
    assert_eq!(lease.lease_state, "released");
    let binding = harness
        .store
        .with_tx::<_, ApiError, _>(|tx| Ok(tx.get_worktree_binding("preview-1")?))
        .unwrap()
        .unwrap();
    assert_eq!(binding.binding_state, "released");

    // And main was pushed exactly once.
    let pushed = harness.git.state.lock().unwrap().pushed.clone();
    assert_eq!(pushed, vec![("origin".to_string(), "main".to_string())]);
}

#[tokio::test]
async fn saturated_pool_parks_fourth_run() {
    let harness = harness();
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(submit(&harness, &format!("Run {i}")));
    }

    for run_id in &ids[..3] {
        assert!(matches!(
            allocate(&harness, run_id).await,
            AllocationOutcome::Allocated { .. }
        ));
    }

    let outcome = allocate(&harness, &ids[3]).await;
    let AllocationOutcome::Waiting {
        reason,
        occupied_slots,
    } = outcome
    else {
        panic!("expected waiting, got {outcome:?}");
    };
    assert_eq!(reason, "WAITING_FOR_SLOT");
    assert_eq!(occupied_slots, vec!["preview-1", "preview-2", "preview-3"]);

    // The fourth run is still queued and retries after a slot frees up.
    assert_eq!(run_state(&harness, &ids[3]), RunState::Queued);
    harness.slots.release("preview-2", None).unwrap();
    let retry = allocate(&harness, &ids[3]).await;
    match retry {
        AllocationOutcome::Allocated { slot_id, .. } => assert_eq!(slot_id, "preview-2"),
        other => panic!("expected allocation after release, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_lease_is_reaped_and_run_resumed() {
    let harness = harness_with(|config| config.slot_lease_ttl_seconds = 2);
    let run_id = submit(&harness, "Slow run");
    allocate(&harness, &run_id).await;
    drive_to(&harness, &run_id, &[RunState::Planning, RunState::Editing]);

    // Let the short lease lapse, then reap.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    let reaped = harness.slots.reap_expired().unwrap();
    assert_eq!(reaped.expired_count, 1);
    assert_eq!(run_state(&harness, &run_id), RunState::Expired);

    let run = harness.runs.get(&run_id).unwrap().run;
    assert!(run.slot_id.is_none());

    // Resume creates a fresh child run carrying the same prompt.
    let child = harness.runs.resume(&run_id, Some("operator")).unwrap();
    assert_eq!(child.run.status, RunState::Queued);
    assert_eq!(child.run.parent_run_id.as_deref(), Some(run_id.as_str()));
    assert!(matches!(
        allocate(&harness, &child.run.id).await,
        AllocationOutcome::Allocated { .. }
    ));
}

#[tokio::test]
async fn failed_deploy_restores_previous_release() {
    let harness = harness();
    let run_id = submit(&harness, "Risky change");
    allocate(&harness, &run_id).await;
    drive_to(
        &harness,
        &run_id,
        &[
            RunState::Planning,
            RunState::Editing,
            RunState::Testing,
            RunState::PreviewReady,
            RunState::NeedsApproval,
        ],
    );
    harness
        .store
        .with_tx::<_, ApiError, _>(|tx| {
            tx.set_run_commit_sha(&run_id, "feedbeef", Utc::now())?;
            Ok(())
        })
        .unwrap();
    harness.deploy.set_fail_reload(true);

    harness
        .gate
        .approve(&run_id, &ApproveRequest::default())
        .await
        .unwrap();

    let run = harness.runs.get(&run_id).unwrap().run;
    assert_eq!(run.status, RunState::Failed);

    // The failed release is on record and the pointer is back where it was.
    let failed = harness.gate.get_release("mergedsha").unwrap();
    assert_eq!(failed.status, "deploy_failed");
    assert_eq!(
        *harness.deploy.current.lock().unwrap(),
        Some("genesis".to_string())
    );

    // The transition to failed carries the deploy failure code.
    let events = harness
        .store
        .with_tx::<_, ApiError, _>(|tx| Ok(tx.list_run_events(&run_id, 200)?))
        .unwrap();
    let failed_transition = events
        .iter()
        .rev()
        .find(|e| e.event_type == "status_transition" && e.status_to.as_deref() == Some("failed"))
        .expect("failed transition event");
    assert_eq!(
        failed_transition.payload.as_ref().unwrap()["failure_reason_code"],
        serde_json::json!(FailureReasonCode::DeployHealthcheckFailed.as_str())
    );
}
