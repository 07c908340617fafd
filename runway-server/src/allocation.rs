//! Allocation orchestrator.
//!
//! The single entry point the worker uses to put a newly claimed run into a
//! ready-to-edit state: lease a slot, bind the worktree, reset the preview
//! database. Waiting is only ever produced by the lease step; the later steps
//! compensate on failure so a half-allocated slot is never left behind.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::resets::{ResetCoordinator, ResetRequest, ResetStrategy};
use crate::slots::SlotLeaseManager;
use crate::worktrees::WorktreeManager;

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub run_id: String,
    pub strategy: ResetStrategy,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    pub force: bool,
}

/// The three shapes an allocation attempt can take. `Waiting` is a normal
/// result, not an error; `Failed` carries a machine-readable step reason.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    Allocated {
        slot_id: String,
        branch_name: String,
        worktree_path: String,
        db_name: String,
    },
    Waiting {
        reason: String,
        occupied_slots: Vec<String>,
    },
    Failed {
        reason: String,
        detail: Value,
    },
}

pub struct AllocationOrchestrator {
    slots: Arc<SlotLeaseManager>,
    worktrees: Arc<WorktreeManager>,
    resets: Arc<ResetCoordinator>,
}

impl AllocationOrchestrator {
    pub fn new(
        slots: Arc<SlotLeaseManager>,
        worktrees: Arc<WorktreeManager>,
        resets: Arc<ResetCoordinator>,
    ) -> Self {
        Self {
            slots,
            worktrees,
            resets,
        }
    }

    /// Acquire → assign → reset, with compensation. Idempotent: a run that
    /// already holds its lease re-enters at the assign step, which reuses the
    /// existing worktree.
    pub async fn allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<AllocationOutcome, ApiError> {
        let acquired = self.slots.acquire(&request.run_id, request.force)?;
        if !acquired.acquired {
            return Ok(AllocationOutcome::Waiting {
                reason: acquired
                    .queue_reason
                    .unwrap_or_else(|| crate::slots::WAITING_FOR_SLOT_REASON.to_string()),
                occupied_slots: acquired.occupied_slots,
            });
        }
        let slot_id = acquired
            .slot_id
            .ok_or_else(|| ApiError::internal("acquire returned no slot id"))?;

        let assigned = match self.worktrees.assign(&request.run_id, &slot_id).await {
            Ok(assigned) => assigned,
            Err(err) => {
                warn!(
                    run_id = %request.run_id,
                    slot_id = %slot_id,
                    error = %err,
                    "worktree assign failed; releasing slot"
                );
                self.slots.release(&slot_id, Some(request.run_id.as_str()))?;
                return Ok(AllocationOutcome::Failed {
                    reason: "WORKTREE_ASSIGN_FAILED".to_string(),
                    detail: serde_json::json!({
                        "slot_id": slot_id,
                        "error": err.to_string(),
                    }),
                });
            }
        };

        let reset_request = ResetRequest {
            run_id: request.run_id.clone(),
            slot_id: slot_id.clone(),
            strategy: request.strategy,
            seed_version: request.seed_version.clone(),
            snapshot_version: request.snapshot_version.clone(),
            dry_run: false,
        };
        let reset = match self.resets.reset_and_seed(&reset_request).await {
            Ok(reset) => reset,
            Err(err) => {
                warn!(
                    run_id = %request.run_id,
                    slot_id = %slot_id,
                    error = %err,
                    "preview DB reset failed; rolling back allocation"
                );
                // Compensation order mirrors acquisition order in reverse.
                if let Err(cleanup_err) = self
                    .worktrees
                    .cleanup(&slot_id, Some(request.run_id.as_str()))
                    .await
                {
                    warn!(
                        run_id = %request.run_id,
                        slot_id = %slot_id,
                        error = %cleanup_err,
                        "worktree cleanup during rollback failed"
                    );
                }
                self.slots.release(&slot_id, Some(request.run_id.as_str()))?;
                return Ok(AllocationOutcome::Failed {
                    reason: "PREVIEW_DB_RESET_FAILED".to_string(),
                    detail: serde_json::json!({
                        "slot_id": slot_id,
                        "error": err.to_string(),
                    }),
                });
            }
        };

        info!(
            run_id = %request.run_id,
            slot_id = %slot_id,
            db_name = %reset.db_name,
            "run allocated"
        );

        Ok(AllocationOutcome::Allocated {
            slot_id,
            branch_name: assigned.branch_name,
            worktree_path: assigned.worktree_path,
            db_name: reset.db_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::drivers::mock::{MockDbResetDriver, MockGitDriver};
    use crate::store::{ControlStore, NewRun, StoreError};
    use chrono::Utc;

    struct Fixture {
        orchestrator: AllocationOrchestrator,
        store: Arc<ControlStore>,
        git: Arc<MockGitDriver>,
        db: Arc<MockDbResetDriver>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ControlStore::open_in_memory().expect("store"));
        let config = Arc::new(Config::for_tests());
        store.ensure_slot_rows(&config.slot_ids).expect("seed slots");
        let git = Arc::new(MockGitDriver::new());
        let db = Arc::new(MockDbResetDriver::new());
        let slots = Arc::new(SlotLeaseManager::new(store.clone(), config.clone()));
        let worktrees = Arc::new(WorktreeManager::new(
            store.clone(),
            config.clone(),
            git.clone(),
        ));
        let resets = Arc::new(ResetCoordinator::new(
            store.clone(),
            config.clone(),
            db.clone(),
        ));
        Fixture {
            orchestrator: AllocationOrchestrator::new(slots, worktrees, resets),
            store,
            git,
            db,
        }
    }

    fn insert_run(store: &ControlStore, run_id: &str) {
        store
            .with_tx::<_, StoreError, _>(|tx| {
                tx.insert_run(
                    &NewRun {
                        id: run_id.to_string(),
                        title: format!("Run {run_id}"),
                        prompt: "prompt".to_string(),
                        route: None,
                        created_by: None,
                        parent_run_id: None,
                    },
                    Utc::now(),
                )
            })
            .expect("insert run");
    }

    fn seed_allocation(run_id: &str) -> AllocationRequest {
        AllocationRequest {
            run_id: run_id.to_string(),
            strategy: ResetStrategy::Seed,
            seed_version: Some("v1".to_string()),
            snapshot_version: None,
            force: false,
        }
    }

    #[tokio::test]
    async fn test_allocation_happy_path() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let outcome = fixture
            .orchestrator
            .allocate(&seed_allocation("R1"))
            .await
            .unwrap();
        match outcome {
            AllocationOutcome::Allocated {
                slot_id,
                branch_name,
                worktree_path,
                db_name,
            } => {
                assert_eq!(slot_id, "preview-1");
                assert_eq!(branch_name, "codex/run-R1");
                assert!(worktree_path.ends_with("preview-1"));
                assert_eq!(db_name, "app_preview_1");
            }
            other => panic!("expected Allocated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_allocation_is_idempotent() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let first = fixture
            .orchestrator
            .allocate(&seed_allocation("R1"))
            .await
            .unwrap();
        let second = fixture
            .orchestrator
            .allocate(&seed_allocation("R1"))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_allocation_reports_waiting_when_saturated() {
        let fixture = fixture();
        for run_id in ["R1", "R2", "R3", "R4"] {
            insert_run(&fixture.store, run_id);
        }
        for run_id in ["R1", "R2", "R3"] {
            fixture
                .orchestrator
                .allocate(&seed_allocation(run_id))
                .await
                .unwrap();
        }

        let outcome = fixture
            .orchestrator
            .allocate(&seed_allocation("R4"))
            .await
            .unwrap();
        match outcome {
            AllocationOutcome::Waiting {
                reason,
                occupied_slots,
            } => {
                assert_eq!(reason, "WAITING_FOR_SLOT");
                assert_eq!(occupied_slots, vec!["preview-1", "preview-2", "preview-3"]);
            }
            other => panic!("expected Waiting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_assign_failure_releases_the_slot() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.git.state.lock().unwrap().fail_worktree_add = true;

        let outcome = fixture
            .orchestrator
            .allocate(&seed_allocation("R1"))
            .await
            .unwrap();
        match outcome {
            AllocationOutcome::Failed { reason, .. } => {
                assert_eq!(reason, "WORKTREE_ASSIGN_FAILED");
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        // The slot came back to the pool.
        let lease = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_slot_lease("preview-1"))
            .unwrap()
            .unwrap();
        assert_eq!(lease.lease_state, "released");
    }

    #[tokio::test]
    async fn test_reset_failure_cleans_worktree_and_releases_slot() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.db.set_fail_apply(true);

        let outcome = fixture
            .orchestrator
            .allocate(&seed_allocation("R1"))
            .await
            .unwrap();
        match outcome {
            AllocationOutcome::Failed { reason, .. } => {
                assert_eq!(reason, "PREVIEW_DB_RESET_FAILED");
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        let lease = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_slot_lease("preview-1"))
            .unwrap()
            .unwrap();
        assert_eq!(lease.lease_state, "released");
        assert!(fixture.git.state.lock().unwrap().worktrees.is_empty());

        let binding = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_worktree_binding("preview-1"))
            .unwrap()
            .unwrap();
        assert!(!binding.is_active());
    }
}
