//! Scripted in-memory drivers for tests.
//!
//! Each mock records the calls it receives and can be told to fail specific
//! operations. They live outside `#[cfg(test)]` so integration tests can use
//! them too; nothing in the production wiring references this module.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CheckRunner, CommandOutput, DbResetDriver, DeployDriver, DriverError, GitDriver, HealthProbe,
    MergeResult,
};

fn ok_output() -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        timed_out: false,
        output: String::new(),
    }
}

/// Git driver that tracks branches and worktrees in memory.
#[derive(Default)]
pub struct MockGitDriver {
    pub state: Mutex<MockGitState>,
}

#[derive(Default)]
pub struct MockGitState {
    pub branches: Vec<String>,
    /// worktree path -> branch
    pub worktrees: HashMap<PathBuf, String>,
    /// Paths whose removal should fail as if uncommitted changes exist.
    pub dirty_worktrees: Vec<PathBuf>,
    pub merge_conflict: bool,
    pub fail_push: bool,
    pub fail_worktree_add: bool,
    pub merged_shas: Vec<String>,
    pub pushed: Vec<(String, String)>,
    pub deleted_branches: Vec<String>,
    pub head_sha: String,
    pub next_merge_sha: String,
}

impl MockGitDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        {
            let mut state = driver.state.lock().expect("mutex poisoned");
            state.head_sha = "feedbeef".to_string();
            state.next_merge_sha = "mergedsha".to_string();
            state.branches.push("main".to_string());
        }
        driver
    }
}

#[async_trait]
impl GitDriver for MockGitDriver {
    async fn ensure_branch(&self, branch: &str, _base: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        if !state.branches.iter().any(|b| b == branch) {
            state.branches.push(branch.to_string());
        }
        Ok(())
    }

    async fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.fail_worktree_add {
            return Err(DriverError::failed("worktree add refused by test"));
        }
        state
            .worktrees
            .insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.dirty_worktrees.iter().any(|p| p == path) {
            return Err(DriverError::failed(format!(
                "worktree at {} contains modified or untracked files",
                path.display()
            )));
        }
        state.worktrees.remove(path);
        Ok(())
    }

    async fn worktree_branch(&self, path: &Path) -> Result<Option<String>, DriverError> {
        let state = self.state.lock().expect("mutex poisoned");
        Ok(state.worktrees.get(path).cloned())
    }

    async fn rev_parse(&self, _rev: &str) -> Result<Option<String>, DriverError> {
        let state = self.state.lock().expect("mutex poisoned");
        Ok(Some(state.head_sha.clone()))
    }

    async fn worktree_head(&self, _path: &Path) -> Result<Option<String>, DriverError> {
        let state = self.state.lock().expect("mutex poisoned");
        Ok(Some(state.head_sha.clone()))
    }

    async fn merge(&self, _base: &str, commit: &str) -> Result<MergeResult, DriverError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.merge_conflict {
            return Ok(MergeResult::Conflict {
                detail: "CONFLICT (content): merge conflict in src/app.rs".to_string(),
            });
        }
        state.merged_shas.push(commit.to_string());
        Ok(MergeResult::Merged {
            commit_sha: state.next_merge_sha.clone(),
        })
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<String, DriverError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        if state.fail_push {
            return Err(DriverError::failed("remote rejected: non-fast-forward"));
        }
        state.pushed.push((remote.to_string(), branch.to_string()));
        Ok(format!("To {remote}\n * {branch} -> {branch}\n"))
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mutex poisoned");
        state.branches.retain(|b| b != branch);
        state.deleted_branches.push(branch.to_string());
        Ok(())
    }
}

/// DB reset driver that records calls and can fail on demand.
#[derive(Default)]
pub struct MockDbResetDriver {
    pub calls: Mutex<Vec<String>>,
    pub fail_apply: Mutex<bool>,
}

impl MockDbResetDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_apply(&self, fail: bool) {
        *self.fail_apply.lock().expect("mutex poisoned") = fail;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl DbResetDriver for MockDbResetDriver {
    async fn drop_and_recreate_public_schema(&self, db_name: &str) -> Result<(), DriverError> {
        self.calls
            .lock()
            .expect("mutex poisoned")
            .push(format!("drop_and_recreate:{db_name}"));
        Ok(())
    }

    async fn apply_sql(&self, db_name: &str, sql_path: &Path) -> Result<(), DriverError> {
        if *self.fail_apply.lock().expect("mutex poisoned") {
            return Err(DriverError::failed("seed apply refused by test"));
        }
        self.calls
            .lock()
            .expect("mutex poisoned")
            .push(format!("apply_sql:{db_name}:{}", sql_path.display()));
        Ok(())
    }
}

/// Deploy driver with an in-memory release pointer.
#[derive(Default)]
pub struct MockDeployDriver {
    pub current: Mutex<Option<String>>,
    pub fail_reload: Mutex<bool>,
    pub reloads: Mutex<Vec<String>>,
    pub switches: Mutex<Vec<String>>,
}

impl MockDeployDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_current(release_id: &str) -> Self {
        let driver = Self::default();
        *driver.current.lock().expect("mutex poisoned") = Some(release_id.to_string());
        driver
    }

    pub fn set_fail_reload(&self, fail: bool) {
        *self.fail_reload.lock().expect("mutex poisoned") = fail;
    }
}

#[async_trait]
impl DeployDriver for MockDeployDriver {
    async fn reload(&self, commit_sha: &str) -> Result<CommandOutput, DriverError> {
        self.reloads
            .lock()
            .expect("mutex poisoned")
            .push(commit_sha.to_string());
        if *self.fail_reload.lock().expect("mutex poisoned") {
            return Ok(CommandOutput {
                exit_code: Some(1),
                timed_out: false,
                output: "reload failed: unit entered failed state".to_string(),
            });
        }
        *self.current.lock().expect("mutex poisoned") = Some(commit_sha.to_string());
        Ok(ok_output())
    }

    async fn current_release(&self) -> Result<Option<String>, DriverError> {
        Ok(self.current.lock().expect("mutex poisoned").clone())
    }

    async fn switch(&self, release_id: &str) -> Result<(), DriverError> {
        self.switches
            .lock()
            .expect("mutex poisoned")
            .push(release_id.to_string());
        *self.current.lock().expect("mutex poisoned") = Some(release_id.to_string());
        Ok(())
    }
}

/// Health probe with a settable verdict.
#[derive(Default)]
pub struct MockHealthProbe {
    pub fail: Mutex<bool>,
}

impl MockHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().expect("mutex poisoned") = fail;
    }
}

#[async_trait]
impl HealthProbe for MockHealthProbe {
    async fn check(&self) -> Result<CommandOutput, DriverError> {
        if *self.fail.lock().expect("mutex poisoned") {
            return Ok(CommandOutput {
                exit_code: Some(22),
                timed_out: false,
                output: "curl: (22) The requested URL returned error: 503".to_string(),
            });
        }
        Ok(ok_output())
    }
}

/// Check runner with per-check verdicts; unknown checks pass.
#[derive(Default)]
pub struct MockCheckRunner {
    pub failing_checks: Mutex<Vec<String>>,
    pub ran: Mutex<Vec<String>>,
}

impl MockCheckRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_check(&self, name: &str) {
        self.failing_checks
            .lock()
            .expect("mutex poisoned")
            .push(name.to_string());
    }
}

#[async_trait]
impl CheckRunner for MockCheckRunner {
    async fn run_check(&self, name: &str, _cwd: &Path) -> Result<CommandOutput, DriverError> {
        self.ran.lock().expect("mutex poisoned").push(name.to_string());
        let failing = self.failing_checks.lock().expect("mutex poisoned");
        if failing.iter().any(|check| check == name) {
            return Ok(CommandOutput {
                exit_code: Some(1),
                timed_out: false,
                output: format!("{name}: 3 errors"),
            });
        }
        Ok(ok_output())
    }
}
