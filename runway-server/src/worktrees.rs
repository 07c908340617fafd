//! Worktree binding manager.
//!
//! Owns the mapping between an active slot lease and the git branch plus
//! on-disk worktree the coding agent edits in. One branch and one worktree
//! per run; the binding row per slot is the coordination point that makes the
//! worktree effectively single-writer.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use runway_core::branch_name_for_run;

use crate::config::Config;
use crate::drivers::GitDriver;
use crate::error::ApiError;
use crate::observability;
use crate::runs::get_run_or_not_found;
use crate::store::{AppendRunEvent, AuditKeys, ControlStore, SlotWorktreeBindingRow};

#[derive(Debug, Clone, PartialEq)]
pub struct AssignOutcome {
    pub assigned: bool,
    pub reused: bool,
    pub slot_id: String,
    pub run_id: String,
    pub branch_name: String,
    pub worktree_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupOutcome {
    pub cleaned: bool,
    pub slot_id: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchCleanupOutcome {
    pub deleted: bool,
    pub run_id: String,
    pub branch_name: Option<String>,
    pub reason: Option<String>,
}

/// Per-slot binding state for the list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeBindingView {
    pub slot_id: String,
    pub state: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub binding_state: Option<String>,
    pub last_action: Option<String>,
    pub updated_at: Option<chrono::DateTime<Utc>>,
}

pub struct WorktreeManager {
    store: Arc<ControlStore>,
    config: Arc<Config>,
    git: Arc<dyn GitDriver>,
}

impl WorktreeManager {
    pub fn new(store: Arc<ControlStore>, config: Arc<Config>, git: Arc<dyn GitDriver>) -> Self {
        Self { store, config, git }
    }

    fn slot_worktree_path(&self, slot_id: &str) -> PathBuf {
        self.config.worktree_root.join(slot_id)
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

    /// Bind the run's branch and worktree to the slot it holds a lease on.
    ///
    /// Idempotent: a registered worktree already pointing at the run's branch
    /// is reused. A worktree pointing at a different branch is removed
    /// (non-force) before the fresh add.
    pub async fn assign(&self, run_id: &str, slot_id: &str) -> Result<AssignOutcome, ApiError> {
        let slot_id = self.validate_slot(slot_id)?;
        let branch_name = branch_name_for_run(run_id)?;
        let worktree_path = self.slot_worktree_path(&slot_id);
        let worktree_str = worktree_path.to_string_lossy().to_string();

        // Preconditions checked against current rows before any git call.
        self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            let now = Utc::now();
            let lease = tx
                .get_slot_lease(&slot_id)?
                .filter(|lease| lease.run_id.as_deref() == Some(run_id) && lease.is_active(now));
            if lease.is_none() {
                return Err(ApiError::conflict(format!(
                    "run '{}' does not hold an active lease on slot '{}'",
                    run_id, slot_id
                )));
            }
            if let Some(existing) = &run.branch_name {
                if existing != &branch_name {
                    return Err(ApiError::conflict(format!(
                        "run '{}' already has branch '{}' (expected '{}')",
                        run_id, existing, branch_name
                    )));
                }
            }
            if let Some(existing_slot) = &run.slot_id {
                if existing_slot != &slot_id {
                    return Err(ApiError::conflict(format!(
                        "run '{}' is bound to slot '{}'",
                        run_id, existing_slot
                    )));
                }
            }
            Ok(())
        })?;

        let existing_branch = self
            .git
            .worktree_branch(&worktree_path)
            .await
            .map_err(driver_error)?;

        let reused = match existing_branch {
            Some(ref branch) if branch == &branch_name => true,
            Some(_) => {
                // Previous run's worktree still checked out here; a dirty
                // tree makes this removal fail, which is the safety we want.
                self.git
                    .remove_worktree(&worktree_path)
                    .await
                    .map_err(driver_error)?;
                false
            }
            None => false,
        };

        if !reused {
            self.git
                .ensure_branch(&branch_name, &self.config.main_branch)
                .await
                .map_err(driver_error)?;
            self.git
                .create_worktree(&worktree_path, &branch_name)
                .await
                .map_err(driver_error)?;
        }

        let (event_type, action, last_action) = if reused {
            ("worktree_reused", "worktree.reuse", "reused")
        } else {
            ("worktree_assigned", "worktree.assign", "assigned")
        };
        let trace_id = observability::current_trace_id();

        self.store.with_tx(|tx| {
            let now = Utc::now();
            tx.upsert_active_binding(
                &slot_id,
                run_id,
                &branch_name,
                &worktree_str,
                last_action,
                now,
            )?;
            tx.set_run_slot(run_id, Some(slot_id.as_str()), now)?;
            tx.set_run_workspace(run_id, Some(branch_name.as_str()), Some(worktree_str.as_str()), now)?;

            let payload = json!({
                "slot_id": slot_id,
                "run_id": run_id,
                "branch_name": branch_name,
                "worktree_path": worktree_str,
                "reused": reused,
            });
            tx.append_run_event(
                AppendRunEvent::new(run_id, event_type)
                    .payload(payload.clone())
                    .trace(trace_id.as_deref()),
                now,
            )?;
            tx.append_audit(
                None,
                action,
                &payload,
                AuditKeys {
                    run_id: Some(run_id),
                    slot_id: Some(slot_id.as_str()),
                    commit_sha: None,
                    trace_id: trace_id.as_deref(),
                },
                now,
            )?;
            Ok::<_, ApiError>(())
        })?;

        info!(run_id, slot_id = %slot_id, branch = %branch_name, reused, "worktree bound");

        Ok(AssignOutcome {
            assigned: true,
            reused,
            slot_id,
            run_id: run_id.to_string(),
            branch_name,
            worktree_path: worktree_str,
        })
    }

    /// Remove the slot's worktree (non-force) and release the binding row.
    /// Idempotent when no worktree is registered at the path; a dirty
    /// worktree fails the removal and leaves the binding active.
    pub async fn cleanup(
        &self,
        slot_id: &str,
        run_id: Option<&str>,
    ) -> Result<CleanupOutcome, ApiError> {
        let slot_id = self.validate_slot(slot_id)?;

        let binding = self
            .store
            .with_tx(|tx| Ok::<_, ApiError>(tx.get_worktree_binding(&slot_id)?))?;

        let Some(binding) = binding.filter(|b| b.is_active()) else {
            return Ok(CleanupOutcome {
                cleaned: false,
                slot_id,
                run_id: run_id.map(str::to_string),
                branch_name: None,
                worktree_path: None,
                reason: Some("no_active_binding".to_string()),
            });
        };

        if let Some(expected) = run_id {
            if binding.run_id.as_deref() != Some(expected) {
                return Err(ApiError::conflict(format!(
                    "slot '{}' worktree is bound to run '{}', not '{}'",
                    slot_id,
                    binding.run_id.as_deref().unwrap_or("<none>"),
                    expected
                )));
            }
        }

        let worktree_path = binding
            .worktree_path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.slot_worktree_path(&slot_id));

        let registered = self
            .git
            .worktree_branch(&worktree_path)
            .await
            .map_err(driver_error)?;
        if registered.is_some() {
            self.git
                .remove_worktree(&worktree_path)
                .await
                .map_err(driver_error)?;
        }

        let owning_run = binding.run_id.clone();
        self.store.with_tx(|tx| {
            let now = Utc::now();
            tx.mark_binding_released(&slot_id, now)?;
            if let Some(owner) = &owning_run {
                if let Some(run) = tx.get_run(owner)? {
                    if run.worktree_path.as_deref() == binding.worktree_path.as_deref() {
                        tx.clear_run_worktree_path(owner, now)?;
                    }
                }
            }
            let payload = json!({
                "slot_id": slot_id,
                "run_id": owning_run,
                "branch_name": binding.branch_name,
                "worktree_path": binding.worktree_path,
            });
            if let Some(owner) = &owning_run {
                tx.append_run_event(
                    AppendRunEvent::new(owner, "worktree_cleaned")
                        .payload(payload.clone())
                        .trace(observability::current_trace_id().as_deref()),
                    now,
                )?;
            }
            tx.append_audit(
                None,
                "worktree.cleanup",
                &payload,
                AuditKeys {
                    run_id: owning_run.as_deref(),
                    slot_id: Some(slot_id.as_str()),
                    ..Default::default()
                },
                now,
            )?;
            Ok::<_, ApiError>(())
        })?;

        info!(slot_id = %slot_id, run_id = ?owning_run, "worktree cleaned up");

        Ok(CleanupOutcome {
            cleaned: true,
            slot_id,
            run_id: owning_run,
            branch_name: binding.branch_name,
            worktree_path: binding.worktree_path,
            reason: None,
        })
    }

    /// Delete a rejected run's branch (non-force). The worktree must already
    /// be cleaned up or the deletion will fail in git.
    pub async fn delete_run_branch(
        &self,
        run_id: &str,
        actor: Option<&str>,
    ) -> Result<BranchCleanupOutcome, ApiError> {
        let run = self
            .store
            .with_tx(|tx| get_run_or_not_found(tx, run_id))?;

        let Some(branch_name) = run.branch_name.clone() else {
            return Ok(BranchCleanupOutcome {
                deleted: false,
                run_id: run_id.to_string(),
                branch_name: None,
                reason: Some("no_branch_recorded".to_string()),
            });
        };

        if let Err(err) = self.git.delete_branch(&branch_name).await {
            warn!(run_id, branch = %branch_name, error = %err, "branch delete failed");
            return Ok(BranchCleanupOutcome {
                deleted: false,
                run_id: run_id.to_string(),
                branch_name: Some(branch_name),
                reason: Some(err.to_string()),
            });
        }

        self.store.with_tx(|tx| {
            let now = Utc::now();
            let payload = json!({ "run_id": run_id, "branch_name": branch_name });
            tx.append_run_event(
                AppendRunEvent::new(run_id, "branch_deleted")
                    .payload(payload.clone())
                    .actor(actor)
                    .trace(observability::current_trace_id().as_deref()),
                now,
            )?;
            tx.append_audit(
                actor,
                "worktree.branch_delete",
                &payload,
                AuditKeys {
                    run_id: Some(run_id),
                    ..Default::default()
                },
                now,
            )?;
            Ok::<_, ApiError>(())
        })?;

        Ok(BranchCleanupOutcome {
            deleted: true,
            run_id: run_id.to_string(),
            branch_name: Some(branch_name),
            reason: None,
        })
    }

    /// Binding rows for every configured slot, `unbound` where none exists.
    pub fn list(&self) -> Result<Vec<WorktreeBindingView>, ApiError> {
        self.store.with_tx(|tx| {
            let bindings = tx.list_worktree_bindings()?;
            let by_slot: std::collections::HashMap<&str, &SlotWorktreeBindingRow> = bindings
                .iter()
                .map(|binding| (binding.slot_id.as_str(), binding))
                .collect();

            Ok(self
                .config
                .slot_ids
                .iter()
                .map(|slot_id| match by_slot.get(slot_id.as_str()) {
                    Some(binding) => WorktreeBindingView {
                        slot_id: slot_id.clone(),
                        state: if binding.is_active() { "bound" } else { "released" }.to_string(),
                        run_id: binding.run_id.clone(),
                        branch_name: binding.branch_name.clone(),
                        worktree_path: binding.worktree_path.clone(),
                        binding_state: Some(binding.binding_state.clone()),
                        last_action: Some(binding.last_action.clone()),
                        updated_at: Some(binding.updated_at),
                    },
                    None => WorktreeBindingView {
                        slot_id: slot_id.clone(),
                        state: "unbound".to_string(),
                        run_id: None,
                        branch_name: None,
                        worktree_path: None,
                        binding_state: None,
                        last_action: None,
                        updated_at: None,
                    },
                })
                .collect())
        })
    }
}

fn driver_error(err: crate::drivers::DriverError) -> ApiError {
    if err.is_timeout() {
        ApiError::timeout(err.detail().to_string())
    } else {
        ApiError::driver_failed(err.detail().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::MockGitDriver;
    use crate::error::ErrorKind;
    use crate::slots::SlotLeaseManager;
    use crate::store::{NewRun, StoreError};

    struct Fixture {
        manager: WorktreeManager,
        slots: SlotLeaseManager,
        store: Arc<ControlStore>,
        git: Arc<MockGitDriver>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ControlStore::open_in_memory().expect("store"));
        let config = Arc::new(Config::for_tests());
        store.ensure_slot_rows(&config.slot_ids).expect("seed slots");
        let git = Arc::new(MockGitDriver::new());
        Fixture {
            manager: WorktreeManager::new(store.clone(), config.clone(), git.clone()),
            slots: SlotLeaseManager::new(store.clone(), config),
            store,
            git,
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

    #[tokio::test]
    async fn test_assign_creates_branch_and_worktree() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();

        let outcome = fixture.manager.assign("R1", "preview-1").await.unwrap();
        assert!(outcome.assigned);
        assert!(!outcome.reused);
        assert_eq!(outcome.branch_name, "codex/run-R1");
        assert!(outcome.worktree_path.ends_with("preview-1"));

        let run = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_run("R1"))
            .unwrap()
            .unwrap();
        assert_eq!(run.branch_name.as_deref(), Some("codex/run-R1"));
        assert_eq!(run.worktree_path.as_deref(), Some(outcome.worktree_path.as_str()));

        let state = fixture.git.state.lock().unwrap();
        assert!(state.branches.iter().any(|b| b == "codex/run-R1"));
        assert_eq!(state.worktrees.len(), 1);
    }

    #[tokio::test]
    async fn test_assign_requires_active_lease() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let err = fixture
            .manager
            .assign("R1", "preview-1")
            .await
            .expect_err("no lease must be rejected");
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_assign_is_idempotent_and_reuses() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();

        fixture.manager.assign("R1", "preview-1").await.unwrap();
        let second = fixture.manager.assign("R1", "preview-1").await.unwrap();
        assert!(second.reused);

        let binding = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_worktree_binding("preview-1"))
            .unwrap()
            .unwrap();
        assert_eq!(binding.last_action, "reused");

        let events = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.list_run_events("R1", 100))
            .unwrap();
        assert!(events.iter().any(|e| e.event_type == "worktree_assigned"));
        assert!(events.iter().any(|e| e.event_type == "worktree_reused"));
    }

    #[tokio::test]
    async fn test_assign_replaces_foreign_branch_worktree() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();

        // A previous (clean) worktree for another run occupies the slot path.
        let path = fixture.manager.slot_worktree_path("preview-1");
        fixture
            .git
            .state
            .lock()
            .unwrap()
            .worktrees
            .insert(path, "codex/run-OLD".to_string());

        let outcome = fixture.manager.assign("R1", "preview-1").await.unwrap();
        assert!(!outcome.reused);

        let state = fixture.git.state.lock().unwrap();
        let bound: Vec<&String> = state.worktrees.values().collect();
        assert_eq!(bound, vec!["codex/run-R1"]);
    }

    #[tokio::test]
    async fn test_cleanup_releases_binding() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();
        fixture.manager.assign("R1", "preview-1").await.unwrap();

        let outcome = fixture.manager.cleanup("preview-1", Some("R1")).await.unwrap();
        assert!(outcome.cleaned);
        assert_eq!(outcome.run_id.as_deref(), Some("R1"));

        let binding = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_worktree_binding("preview-1"))
            .unwrap()
            .unwrap();
        assert!(!binding.is_active());
        assert_eq!(binding.last_action, "cleaned_up");

        assert!(fixture.git.state.lock().unwrap().worktrees.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_without_binding_is_idempotent() {
        let fixture = fixture();
        let outcome = fixture.manager.cleanup("preview-1", None).await.unwrap();
        assert!(!outcome.cleaned);
        assert_eq!(outcome.reason.as_deref(), Some("no_active_binding"));
    }

    #[tokio::test]
    async fn test_cleanup_of_dirty_worktree_fails_and_keeps_binding() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();
        let assigned = fixture.manager.assign("R1", "preview-1").await.unwrap();

        fixture
            .git
            .state
            .lock()
            .unwrap()
            .dirty_worktrees
            .push(PathBuf::from(&assigned.worktree_path));

        let err = fixture
            .manager
            .cleanup("preview-1", Some("R1"))
            .await
            .expect_err("dirty worktree must fail cleanup");
        assert_eq!(err.kind, ErrorKind::DriverFailed);

        let binding = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.get_worktree_binding("preview-1"))
            .unwrap()
            .unwrap();
        assert!(binding.is_active(), "binding stays active until git succeeds");
    }

    #[tokio::test]
    async fn test_cleanup_by_wrong_run_is_conflict() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();
        fixture.manager.assign("R1", "preview-1").await.unwrap();

        let err = fixture
            .manager
            .cleanup("preview-1", Some("R2"))
            .await
            .expect_err("wrong run must be rejected");
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_delete_run_branch() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();
        fixture.manager.assign("R1", "preview-1").await.unwrap();
        fixture.manager.cleanup("preview-1", Some("R1")).await.unwrap();

        let outcome = fixture.manager.delete_run_branch("R1", None).await.unwrap();
        assert!(outcome.deleted);
        assert_eq!(outcome.branch_name.as_deref(), Some("codex/run-R1"));
        assert!(fixture
            .git
            .state
            .lock()
            .unwrap()
            .deleted_branches
            .contains(&"codex/run-R1".to_string()));
    }

    #[tokio::test]
    async fn test_list_reports_binding_lifecycle() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.slots.acquire("R1", false).unwrap();

        let views = fixture.manager.list().unwrap();
        assert!(views.iter().all(|view| view.state == "unbound"));

        fixture.manager.assign("R1", "preview-1").await.unwrap();
        let views = fixture.manager.list().unwrap();
        assert_eq!(views[0].state, "bound");
        assert_eq!(views[0].last_action.as_deref(), Some("assigned"));

        fixture.manager.cleanup("preview-1", Some("R1")).await.unwrap();
        let views = fixture.manager.list().unwrap();
        assert_eq!(views[0].state, "released");
    }
}
