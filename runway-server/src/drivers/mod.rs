//! Capability interfaces consumed by the core, and their command-backed
//! implementations.
//!
//! The services never spawn a process themselves; they call one of the traits
//! here. Real implementations shell out through [`run_command`], which
//! enforces a timeout and exports the current trace id to the child. Tests
//! substitute the scripted drivers from [`mock`].

pub mod dbreset;
pub mod deploy;
pub mod git;
pub mod mock;

pub use dbreset::PsqlResetDriver;
pub use deploy::{
    default_check_command, CommandCheckRunner, CommandDeployDriver, CommandHealthProbe,
};
pub use git::CliGitDriver;

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::observability;

/// Failure modes of an external capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The external tool ran and reported failure; carries its diagnostics.
    Failed { detail: String },
    /// The step exceeded its configured timeout.
    Timeout { detail: String },
}

impl DriverError {
    pub fn failed(detail: impl Into<String>) -> Self {
        DriverError::Failed {
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        DriverError::Timeout {
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            DriverError::Failed { detail } | DriverError::Timeout { detail } => detail,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout { .. })
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Failed { detail } => write!(f, "driver failed: {}", detail),
            DriverError::Timeout { detail } => write!(f, "driver timed out: {}", detail),
        }
    }
}

impl std::error::Error for DriverError {}

/// Result of one spawned command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by the timeout or a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Interleaved stdout + stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Git operations against the canonical repository and its worktrees.
///
/// Safety rules baked into the implementation: non-interactive invocations
/// only, no `reset --hard`, and worktree removal is never forced; a dirty
/// worktree makes `remove_worktree` fail so the caller has to checkpoint it.
#[async_trait]
pub trait GitDriver: Send + Sync {
    /// Create `branch` off `base` if it does not already exist.
    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), DriverError>;

    /// Add a worktree at `path` checked out to `branch`.
    async fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), DriverError>;

    /// Remove the worktree at `path` (non-force). Removing an unregistered
    /// path is an error; callers check `worktree_branch` first.
    async fn remove_worktree(&self, path: &Path) -> Result<(), DriverError>;

    /// The branch checked out at a registered worktree path, or `None` if no
    /// worktree is registered there.
    async fn worktree_branch(&self, path: &Path) -> Result<Option<String>, DriverError>;

    /// Resolve a revision in the canonical repository. `None` when the
    /// revision does not exist.
    async fn rev_parse(&self, rev: &str) -> Result<Option<String>, DriverError>;

    /// HEAD of the worktree at `path`, or `None` when unreadable.
    async fn worktree_head(&self, path: &Path) -> Result<Option<String>, DriverError>;

    /// Merge `commit` into `base` with a merge commit. Returns the new tip of
    /// `base` or a conflict.
    async fn merge(&self, base: &str, commit: &str) -> Result<MergeResult, DriverError>;

    /// Push `branch` to `remote`. Returns the push transcript.
    async fn push(&self, remote: &str, branch: &str) -> Result<String, DriverError>;

    /// Delete a local branch (non-force).
    async fn delete_branch(&self, branch: &str) -> Result<(), DriverError>;
}

/// Outcome of a merge attempt. Conflicts are an expected result, not a
/// driver failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged { commit_sha: String },
    Conflict { detail: String },
}

/// Destructive operations against a slot's preview database. The coordinator
/// validates the target name before any of these is called.
#[async_trait]
pub trait DbResetDriver: Send + Sync {
    async fn drop_and_recreate_public_schema(&self, db_name: &str) -> Result<(), DriverError>;
    async fn apply_sql(&self, db_name: &str, sql_path: &Path) -> Result<(), DriverError>;
}

/// The deploy hook. Owns the release symlink; `switch` is the rollback
/// primitive the merge gate uses when a reload or health probe fails.
#[async_trait]
pub trait DeployDriver: Send + Sync {
    async fn reload(&self, commit_sha: &str) -> Result<CommandOutput, DriverError>;
    async fn current_release(&self) -> Result<Option<String>, DriverError>;
    async fn switch(&self, release_id: &str) -> Result<(), DriverError>;
}

/// Post-deploy health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<CommandOutput, DriverError>;
}

/// Merge-gate check commands, run inside the run's worktree.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run_check(&self, name: &str, cwd: &Path) -> Result<CommandOutput, DriverError>;
}

/// Split a configured command line into program + arguments. Handles single
/// and double quotes; no variable expansion or escapes beyond that.
pub fn split_command(raw: &str) -> Result<Vec<String>, DriverError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        parts.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err(DriverError::failed(format!(
            "unbalanced quote in command: {raw}"
        )));
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.is_empty() {
        return Err(DriverError::failed("empty command"));
    }
    Ok(parts)
}

/// Spawn a command with a timeout, capturing interleaved output.
///
/// The current trace id (if the calling task carries one) is exported to the
/// child as `TRACE_ID`, plus any extra environment the caller supplies. A
/// timeout kills the child and reports `timed_out` rather than erroring, so
/// callers can attach the partial transcript to artifacts.
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
    extra_env: &[(&str, &str)],
) -> Result<CommandOutput, DriverError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DriverError::failed("empty command"))?;

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(trace_id) = observability::current_trace_id() {
        command.env("TRACE_ID", trace_id);
    }
    for (key, value) in extra_env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| DriverError::failed(format!("spawn '{}': {}", program, e)))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let gather = async {
        let mut out = String::new();
        let mut err = String::new();
        let _ = stdout.read_to_string(&mut out).await;
        let _ = stderr.read_to_string(&mut err).await;
        let status = child.wait().await;
        (out, err, status)
    };

    match tokio::time::timeout(timeout, gather).await {
        Ok((out, err, status)) => {
            let status = status
                .map_err(|e| DriverError::failed(format!("wait for '{}': {}", program, e)))?;
            Ok(CommandOutput {
                exit_code: status.code(),
                timed_out: false,
                output: format!("{}{}", out, err),
            })
        }
        Err(_) => Ok(CommandOutput {
            exit_code: None,
            timed_out: true,
            output: String::new(),
        }),
    }
}
