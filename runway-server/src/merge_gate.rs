//! Merge/deploy gate.
//!
//! Finalizes an approved run: re-check on the exact commit, merge to main,
//! push, activate and reload the release, health-probe, and make the terminal
//! transition. Every sub-step failure is persisted (event + audit + artifact)
//! before being surfaced, and a failed reload or health probe rolls the
//! release pointer back to the previous deployed release.
//!
//! A failed push is the one place with no automatic rollback: the merge
//! commit exists locally but never reached the remote, and reconciling that
//! is an operator decision. The run fails with `DEPLOY_PUSH_FAILED` and the
//! push transcript is attached as an artifact.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use runway_core::{FailureReasonCode, RunState};

use crate::config::Config;
use crate::drivers::{CheckRunner, DeployDriver, GitDriver, HealthProbe, MergeResult};
use crate::error::ApiError;
use crate::observability;
use crate::runs::{apply_transition, get_run_or_not_found};
use crate::slots::release_lease_if_held;
use crate::store::{AppendRunEvent, ApprovalRow, ControlStore, RunRow};
use crate::worktrees::WorktreeManager;

#[derive(Debug, Clone, Default)]
pub struct ApproveRequest {
    pub reviewer_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RejectRequest {
    pub reviewer_id: Option<String>,
    pub reason: String,
    pub failure_reason_code: FailureReasonCode,
}

/// How finalize ended. Pipeline failures are a normal outcome here: the run
/// has already been transitioned and the evidence persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Merged {
        release_id: String,
    },
    Failed {
        failure_reason_code: FailureReasonCode,
        detail: String,
    },
}

pub struct MergeGate {
    store: Arc<ControlStore>,
    config: Arc<Config>,
    git: Arc<dyn GitDriver>,
    deploy: Arc<dyn DeployDriver>,
    health: Arc<dyn HealthProbe>,
    checks: Arc<dyn CheckRunner>,
    worktrees: Arc<WorktreeManager>,
}

impl MergeGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ControlStore>,
        config: Arc<Config>,
        git: Arc<dyn GitDriver>,
        deploy: Arc<dyn DeployDriver>,
        health: Arc<dyn HealthProbe>,
        checks: Arc<dyn CheckRunner>,
        worktrees: Arc<WorktreeManager>,
    ) -> Self {
        Self {
            store,
            config,
            git,
            deploy,
            health,
            checks,
            worktrees,
        }
    }

    /// Record the approval and drive the merge pipeline.
    ///
    /// Accepts runs in `needs_approval`, or in `preview_ready` (which
    /// auto-advances through `needs_approval` first). The approval row is
    /// returned even when the pipeline subsequently fails; the run itself
    /// carries the failure.
    pub async fn approve(
        &self,
        run_id: &str,
        request: &ApproveRequest,
    ) -> Result<ApprovalRow, ApiError> {
        let reviewer = request.reviewer_id.as_deref();
        let trace_id = observability::current_trace_id();

        let approval = self.store.with_tx::<_, ApiError, _>(|tx| {
            let mut run = get_run_or_not_found(tx, run_id)?;

            if run.status == RunState::PreviewReady {
                run = apply_transition(
                    tx,
                    &run,
                    RunState::NeedsApproval,
                    None,
                    Some(json!({ "source": "approve_endpoint", "phase": "auto_needs_approval" })),
                    reviewer,
                    "run.approve.auto_needs_approval",
                )?;
            }

            let run = apply_transition(
                tx,
                &run,
                RunState::Approved,
                None,
                Some(json!({ "source": "approve_endpoint", "phase": "approved" })),
                reviewer,
                "run.approve.accepted",
            )?;

            let approval = tx.insert_approval(
                &run.id,
                reviewer,
                "approved",
                request.reason.as_deref(),
                None,
                Utc::now(),
            )?;
            tx.append_run_event(
                AppendRunEvent::new(&run.id, "approval_decision")
                    .payload(json!({
                        "decision": "approved",
                        "reason": request.reason,
                    }))
                    .actor(reviewer)
                    .audit("run.approve.decision")
                    .trace(trace_id.as_deref()),
                Utc::now(),
            )?;
            Ok(approval)
        })?;

        self.finalize(run_id, reviewer).await?;
        Ok(approval)
    }

    /// Record a rejection. Non-terminal runs fail with the supplied code and
    /// their slot, worktree, and branch are torn down; terminal runs only get
    /// the approval record.
    pub async fn reject(
        &self,
        run_id: &str,
        request: &RejectRequest,
    ) -> Result<ApprovalRow, ApiError> {
        let reviewer = request.reviewer_id.as_deref();
        let trace_id = observability::current_trace_id();
        let code = request.failure_reason_code;

        let (approval, held_slot, status_changed) = self.store.with_tx::<_, ApiError, _>(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            let status_changed = !run.status.is_terminal();
            let held_slot = run.slot_id.clone();

            if status_changed {
                apply_transition(
                    tx,
                    &run,
                    RunState::Failed,
                    Some(code),
                    Some(json!({
                        "source": "reject_endpoint",
                        "reason": request.reason,
                    })),
                    reviewer,
                    "run.approve.rejected",
                )?;
                if let Some(slot_id) = &held_slot {
                    release_lease_if_held(tx, slot_id, run_id, Utc::now())?;
                }
            }

            let approval = tx.insert_approval(
                run_id,
                reviewer,
                "rejected",
                Some(request.reason.as_str()),
                Some(code.as_str()),
                Utc::now(),
            )?;
            tx.append_run_event(
                AppendRunEvent::new(run_id, "approval_decision")
                    .payload(json!({
                        "decision": "rejected",
                        "reason": request.reason,
                        "failure_reason_code": code.as_str(),
                        "status_changed": status_changed,
                    }))
                    .actor(reviewer)
                    .audit("run.approve.decision")
                    .trace(trace_id.as_deref()),
                Utc::now(),
            )?;
            Ok((approval, held_slot, status_changed))
        })?;

        if status_changed {
            let cleanup = match held_slot.as_deref() {
                Some(slot_id) => match self.worktrees.cleanup(slot_id, Some(run_id)).await {
                    Ok(outcome) => json!({ "cleaned": outcome.cleaned, "reason": outcome.reason }),
                    Err(err) => json!({ "cleaned": false, "reason": err.to_string() }),
                },
                None => json!({ "cleaned": false, "reason": "run_slot_not_assigned" }),
            };
            let branch = match self.worktrees.delete_run_branch(run_id, reviewer).await {
                Ok(outcome) => json!({ "deleted": outcome.deleted, "reason": outcome.reason }),
                Err(err) => json!({ "deleted": false, "reason": err.to_string() }),
            };

            self.store.with_tx(|tx| {
                tx.append_run_event(
                    AppendRunEvent::new(run_id, "reject_cleanup")
                        .payload(json!({
                            "slot_id": held_slot,
                            "resource_cleanup": cleanup,
                            "branch_cleanup": branch,
                        }))
                        .actor(reviewer)
                        .trace(trace_id.as_deref()),
                    Utc::now(),
                )?;
                Ok::<_, ApiError>(())
            })?;
        }

        Ok(approval)
    }

    /// Run the merge pipeline for a run in `approved`.
    pub async fn finalize(
        &self,
        run_id: &str,
        actor: Option<&str>,
    ) -> Result<FinalizeOutcome, ApiError> {
        let run = self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            if run.status != RunState::Approved {
                return Err(ApiError::conflict(format!(
                    "run '{}' is '{}'; merge gate requires 'approved'",
                    run.id, run.status
                )));
            }
            apply_transition(
                tx,
                &run,
                RunState::Merging,
                None,
                Some(json!({ "source": "merge_gate", "phase": "merge_start" })),
                actor,
                "run.merge.started",
            )
        })?;

        let Some(commit_sha) = run.commit_sha.clone() else {
            return self
                .fail(
                    &run,
                    FailureReasonCode::MergeConflict,
                    "missing_commit_sha",
                    actor,
                    "run.merge.failed",
                )
                .await;
        };

        if self.config.merge_gate_recheck_required {
            if let Some(outcome) = self.recheck(&run, &commit_sha, actor).await? {
                return Ok(outcome);
            }
        }

        // Merge into main. Conflicts are an expected outcome; driver errors
        // are infrastructure failures but fail the run the same way.
        let merged_sha = match self.git.merge(&self.config.main_branch, &commit_sha).await {
            Ok(MergeResult::Merged { commit_sha }) => commit_sha,
            Ok(MergeResult::Conflict { detail }) => {
                return self
                    .fail(
                        &run,
                        FailureReasonCode::MergeConflict,
                        &detail,
                        actor,
                        "run.merge.failed",
                    )
                    .await;
            }
            Err(err) => {
                return self
                    .fail(
                        &run,
                        FailureReasonCode::MergeConflict,
                        err.detail(),
                        actor,
                        "run.merge.failed",
                    )
                    .await;
            }
        };

        self.store.with_tx(|tx| {
            tx.set_run_commit_sha(run_id, &merged_sha, Utc::now())?;
            Ok::<_, ApiError>(())
        })?;

        // Push before touching the release. A failed push leaves the local
        // merge in place for operator reconciliation; no auto-revert.
        match self
            .git
            .push(&self.config.git_push_remote, &self.config.main_branch)
            .await
        {
            Ok(transcript) => {
                self.attach_log_artifact(
                    run_id,
                    "deploy",
                    "git-push.log",
                    "deploy_git_push_log",
                    &transcript,
                    json!({ "status": "passed", "remote": self.config.git_push_remote }),
                )?;
            }
            Err(err) => {
                self.attach_log_artifact(
                    run_id,
                    "deploy",
                    "git-push.log",
                    "deploy_git_push_log",
                    err.detail(),
                    json!({ "status": "failed", "remote": self.config.git_push_remote }),
                )?;
                let run = self.reload_run(run_id)?;
                return self
                    .fail(
                        &run,
                        FailureReasonCode::DeployPushFailed,
                        err.detail(),
                        actor,
                        "run.merge.failed",
                    )
                    .await;
            }
        }

        let run = self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            apply_transition(
                tx,
                &run,
                RunState::Deploying,
                None,
                Some(json!({ "source": "merge_gate", "phase": "deploy_start" })),
                actor,
                "run.deploy.started",
            )
        })?;

        // Capture the rollback target before activating the new release.
        let previous_release = self.deploy.current_release().await.ok().flatten();

        if let Err(err) = self.deploy.switch(&merged_sha).await {
            return self
                .deploy_failed(&run, &merged_sha, previous_release.as_deref(), err.detail(), actor)
                .await;
        }

        let reload = match self.deploy.reload(&merged_sha).await {
            Ok(output) => output,
            Err(err) => {
                return self
                    .deploy_failed(&run, &merged_sha, previous_release.as_deref(), err.detail(), actor)
                    .await;
            }
        };
        let mut reload_log = reload.output.clone();
        if !reload.succeeded() {
            let detail = if reload.timed_out {
                "backend_reload_timeout".to_string()
            } else {
                format!("backend_reload_failed:exit_{}", exit_code_label(&reload))
            };
            self.attach_log_artifact(
                run_id,
                "deploy",
                "backend-reload.log",
                "deploy_backend_reload_log",
                &reload_log,
                json!({ "status": "failed", "detail": detail }),
            )?;
            return self
                .deploy_failed(&run, &merged_sha, previous_release.as_deref(), &detail, actor)
                .await;
        }

        let health = match self.health.check().await {
            Ok(output) => output,
            Err(err) => {
                self.attach_log_artifact(
                    run_id,
                    "deploy",
                    "backend-reload.log",
                    "deploy_backend_reload_log",
                    &reload_log,
                    json!({ "status": "failed", "detail": err.detail() }),
                )?;
                return self
                    .deploy_failed(&run, &merged_sha, previous_release.as_deref(), err.detail(), actor)
                    .await;
            }
        };
        reload_log.push_str(&health.output);
        if !health.succeeded() {
            let detail = if health.timed_out {
                "backend_healthcheck_timeout".to_string()
            } else {
                format!("backend_healthcheck_failed:exit_{}", exit_code_label(&health))
            };
            self.attach_log_artifact(
                run_id,
                "deploy",
                "backend-reload.log",
                "deploy_backend_reload_log",
                &reload_log,
                json!({ "status": "failed", "detail": detail }),
            )?;
            return self
                .deploy_failed(&run, &merged_sha, previous_release.as_deref(), &detail, actor)
                .await;
        }

        self.attach_log_artifact(
            run_id,
            "deploy",
            "backend-reload.log",
            "deploy_backend_reload_log",
            &reload_log,
            json!({ "status": "passed" }),
        )?;

        // Terminal bookkeeping: run merged, release registry updated, slot
        // and worktree returned to the pool.
        let held_slot = self.store.with_tx(|tx| {
            let run = get_run_or_not_found(tx, run_id)?;
            let held_slot = run.slot_id.clone();
            if let Some(previous) = tx.latest_deployed_release()? {
                if previous.release_id != merged_sha {
                    tx.upsert_release(
                        &previous.release_id,
                        &previous.commit_sha,
                        "replaced",
                        None,
                        Utc::now(),
                    )?;
                }
            }
            tx.upsert_release(&merged_sha, &merged_sha, "deployed", None, Utc::now())?;
            apply_transition(
                tx,
                &run,
                RunState::Merged,
                None,
                Some(json!({
                    "source": "merge_gate",
                    "phase": "merge_complete",
                    "merged_commit_sha": merged_sha,
                })),
                actor,
                "run.deploy.completed",
            )?;
            if let Some(slot_id) = &held_slot {
                release_lease_if_held(tx, slot_id, run_id, Utc::now())?;
            }
            Ok::<_, ApiError>(held_slot)
        })?;

        if let Some(slot_id) = held_slot {
            if let Err(err) = self.worktrees.cleanup(&slot_id, Some(run_id)).await {
                warn!(run_id, slot_id = %slot_id, error = %err, "post-merge worktree cleanup failed");
                self.store.with_tx(|tx| {
                    tx.append_run_event(
                        AppendRunEvent::new(run_id, "worktree_cleanup_failed")
                            .payload(json!({ "slot_id": slot_id, "error": err.to_string() }))
                            .trace(observability::current_trace_id().as_deref()),
                        Utc::now(),
                    )?;
                    Ok::<_, ApiError>(())
                })?;
            }
        }

        info!(run_id, release_id = %merged_sha, "run merged and deployed");
        Ok(FinalizeOutcome::Merged {
            release_id: merged_sha,
        })
    }

    /// Re-run the required checks against the exact captured commit in the
    /// run's worktree. `Some(outcome)` short-circuits the pipeline.
    async fn recheck(
        &self,
        run: &RunRow,
        commit_sha: &str,
        actor: Option<&str>,
    ) -> Result<Option<FinalizeOutcome>, ApiError> {
        let Some(worktree_path) = run.worktree_path.clone().map(PathBuf::from) else {
            return Ok(Some(
                self.fail(
                    run,
                    FailureReasonCode::MergeConflict,
                    "missing_worktree_path",
                    actor,
                    "run.merge.failed",
                )
                .await?,
            ));
        };

        let head = self
            .git
            .worktree_head(&worktree_path)
            .await
            .unwrap_or(None);
        if head.as_deref() != Some(commit_sha) {
            return Ok(Some(
                self.fail(
                    run,
                    FailureReasonCode::MergeConflict,
                    "head_sha_mismatch_before_checks",
                    actor,
                    "run.merge.failed",
                )
                .await?,
            ));
        }

        for check_name in &self.config.merge_gate_required_checks {
            let started_at = Utc::now();
            let result = self.checks.run_check(check_name, &worktree_path).await;
            let ended_at = Utc::now();

            let (status, output, failure): (&str, String, Option<(FailureReasonCode, String)>) =
                match &result {
                    Ok(output) if output.succeeded() => ("passed", output.output.clone(), None),
                    Ok(output) if output.timed_out => (
                        "timed_out",
                        output.output.clone(),
                        Some((
                            FailureReasonCode::AgentTimeout,
                            format!("check '{}' timed out", check_name),
                        )),
                    ),
                    Ok(output) => (
                        "failed",
                        output.output.clone(),
                        Some((
                            FailureReasonCode::ChecksFailed,
                            format!("check '{}' failed", check_name),
                        )),
                    ),
                    Err(err) => (
                        "failed",
                        err.detail().to_string(),
                        Some((FailureReasonCode::ChecksFailed, err.detail().to_string())),
                    ),
                };

            let artifact_uri = self.write_log_file(
                &run.id,
                "merge-gate",
                &format!("{check_name}.log"),
                &output,
            )?;

            let trace_id = observability::current_trace_id();
            self.store.with_tx(|tx| {
                tx.insert_validation_check(
                    &run.id,
                    &format!("merge_gate:{check_name}"),
                    status,
                    Some(started_at),
                    Some(ended_at),
                    Some(artifact_uri.as_str()),
                )?;
                tx.insert_run_artifact(
                    &run.id,
                    "merge_gate_check_log",
                    &artifact_uri,
                    Some(&json!({
                        "check_name": check_name,
                        "status": status,
                        "expected_commit_sha": commit_sha,
                    })),
                    ended_at,
                )?;
                tx.append_run_event(
                    AppendRunEvent::new(&run.id, "merge_gate_check_finished")
                        .payload(json!({
                            "check_name": check_name,
                            "status": status,
                            "artifact_uri": artifact_uri,
                            "expected_commit_sha": commit_sha,
                        }))
                        .actor(actor)
                        .audit("run.test.final_check_completed")
                        .trace(trace_id.as_deref()),
                    ended_at,
                )?;
                Ok::<_, ApiError>(())
            })?;

            // The commit under test must not move while checks run.
            let head_after = self
                .git
                .worktree_head(&worktree_path)
                .await
                .unwrap_or(None);
            if head_after.as_deref() != Some(commit_sha) {
                return Ok(Some(
                    self.fail(
                        run,
                        FailureReasonCode::MergeConflict,
                        "head_sha_changed_during_checks",
                        actor,
                        "run.merge.failed",
                    )
                    .await?,
                ));
            }

            if let Some((code, detail)) = failure {
                return Ok(Some(
                    self.fail(run, code, &detail, actor, "run.merge.failed").await?,
                ));
            }
        }

        Ok(None)
    }

    /// Deploy-step failure: roll the release pointer back, record the failed
    /// release, and fail the run with `DEPLOY_HEALTHCHECK_FAILED`.
    async fn deploy_failed(
        &self,
        run: &RunRow,
        merged_sha: &str,
        previous_release: Option<&str>,
        detail: &str,
        actor: Option<&str>,
    ) -> Result<FinalizeOutcome, ApiError> {
        error!(run_id = %run.id, detail, "deploy step failed; rolling back");

        let rolled_back = match previous_release {
            Some(previous) => match self.deploy.switch(previous).await {
                Ok(()) => true,
                Err(err) => {
                    error!(run_id = %run.id, error = %err, "release rollback failed");
                    false
                }
            },
            None => false,
        };

        self.store.with_tx(|tx| {
            tx.upsert_release(merged_sha, merged_sha, "deploy_failed", None, Utc::now())?;
            if let (Some(previous), true) = (previous_release, rolled_back) {
                if let Some(row) = tx.get_release(previous)? {
                    tx.upsert_release(previous, &row.commit_sha, "rolled_back", None, Utc::now())?;
                }
            }
            tx.append_run_event(
                AppendRunEvent::new(&run.id, "deploy_rollback")
                    .payload(json!({
                        "failed_release": merged_sha,
                        "restored_release": previous_release,
                        "rolled_back": rolled_back,
                    }))
                    .actor(actor)
                    .audit("run.deploy.rollback")
                    .trace(observability::current_trace_id().as_deref()),
                Utc::now(),
            )?;
            Ok::<_, ApiError>(())
        })?;

        let run = self.reload_run(&run.id)?;
        self.fail(
            &run,
            FailureReasonCode::DeployHealthcheckFailed,
            detail,
            actor,
            "run.deploy.failed",
        )
        .await
    }

    /// Transition the run to `failed` with the given code, returning the
    /// failure as a finalize outcome.
    async fn fail(
        &self,
        run: &RunRow,
        code: FailureReasonCode,
        detail: &str,
        actor: Option<&str>,
        audit_action: &str,
    ) -> Result<FinalizeOutcome, ApiError> {
        self.store.with_tx(|tx| {
            let current = get_run_or_not_found(tx, &run.id)?;
            apply_transition(
                tx,
                &current,
                RunState::Failed,
                Some(code),
                Some(json!({
                    "source": "merge_gate",
                    "detail": detail,
                })),
                actor,
                audit_action,
            )
        })?;
        Ok(FinalizeOutcome::Failed {
            failure_reason_code: code,
            detail: detail.to_string(),
        })
    }

    fn reload_run(&self, run_id: &str) -> Result<RunRow, ApiError> {
        self.store.with_tx(|tx| get_run_or_not_found(tx, run_id))
    }

    /// Releases, newest first.
    pub fn list_releases(
        &self,
        status: Option<&str>,
        limit: u32,
    ) -> Result<Vec<crate::store::ReleaseRow>, ApiError> {
        self.store.with_tx(|tx| Ok(tx.list_releases(status, limit)?))
    }

    pub fn get_release(&self, release_id: &str) -> Result<crate::store::ReleaseRow, ApiError> {
        self.store.with_tx(|tx| {
            tx.get_release(release_id)?
                .ok_or_else(|| ApiError::not_found(format!("release '{release_id}' not found")))
        })
    }

    /// Write a log file under the artifact root and return its path.
    fn write_log_file(
        &self,
        run_id: &str,
        subdir: &str,
        file_name: &str,
        contents: &str,
    ) -> Result<String, ApiError> {
        let dir = self.config.artifact_root.join(run_id).join(subdir);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ApiError::internal(format!("create artifact dir: {e}")))?;
        let path = dir.join(file_name);
        std::fs::write(&path, contents)
            .map_err(|e| ApiError::internal(format!("write artifact: {e}")))?;
        Ok(path.to_string_lossy().to_string())
    }

    /// Write a log file and record it as a run artifact.
    fn attach_log_artifact(
        &self,
        run_id: &str,
        subdir: &str,
        file_name: &str,
        artifact_type: &str,
        contents: &str,
        payload: Value,
    ) -> Result<(), ApiError> {
        let artifact_uri = self.write_log_file(run_id, subdir, file_name, contents)?;
        self.store.with_tx(|tx| {
            tx.insert_run_artifact(run_id, artifact_type, &artifact_uri, Some(&payload), Utc::now())?;
            Ok::<_, ApiError>(())
        })
    }
}

fn exit_code_label(output: &crate::drivers::CommandOutput) -> String {
    match output.exit_code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
