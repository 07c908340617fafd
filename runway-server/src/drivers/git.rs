//! Git driver backed by the `git` CLI.
//!
//! All invocations are non-interactive (`-C <repo>` with explicit arguments,
//! never a pager or editor). Worktree state is read through
//! `git worktree list --porcelain` rather than guessed from the filesystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{run_command, CommandOutput, DriverError, GitDriver, MergeResult};

pub struct CliGitDriver {
    repo_root: PathBuf,
    timeout: Duration,
}

impl CliGitDriver {
    pub fn new(repo_root: PathBuf, timeout: Duration) -> Self {
        Self { repo_root, timeout }
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let mut argv: Vec<String> = vec!["git".to_string(), "-C".to_string()];
        argv.push(self.repo_root.to_string_lossy().to_string());
        argv.extend(args.iter().map(|s| s.to_string()));
        let result = run_command(&argv, &self.repo_root, self.timeout, &[]).await?;
        if result.timed_out {
            return Err(DriverError::timeout(format!("git {}", args.join(" "))));
        }
        Ok(result)
    }

    async fn git_ok(&self, args: &[&str]) -> Result<(), DriverError> {
        let result = self.git(args).await?;
        if !result.succeeded() {
            return Err(DriverError::failed(format!(
                "git {} failed: {}",
                args.join(" "),
                result.output.trim()
            )));
        }
        Ok(())
    }

    /// Parse `git worktree list --porcelain` into (path, branch) pairs.
    fn parse_worktree_list(output: &str) -> Vec<(PathBuf, Option<String>)> {
        let mut items = Vec::new();
        let mut current: Option<(PathBuf, Option<String>)> = None;
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                if let Some(item) = current.take() {
                    items.push(item);
                }
                continue;
            }
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(item) = current.take() {
                    items.push(item);
                }
                current = Some((PathBuf::from(path.trim()), None));
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                if let Some((_, branch)) = current.as_mut() {
                    *branch = Some(
                        branch_ref
                            .trim()
                            .strip_prefix("refs/heads/")
                            .unwrap_or(branch_ref.trim())
                            .to_string(),
                    );
                }
            }
        }
        if let Some(item) = current.take() {
            items.push(item);
        }
        items
    }
}

#[async_trait]
impl GitDriver for CliGitDriver {
    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), DriverError> {
        let exists = self
            .git(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .await?;
        if exists.succeeded() {
            return Ok(());
        }
        self.git_ok(&["branch", branch, base]).await
    }

    async fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), DriverError> {
        let path_str = path.to_string_lossy();
        self.git_ok(&["worktree", "add", &path_str, branch]).await
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), DriverError> {
        // No --force: a dirty worktree must fail here and stay on disk.
        let path_str = path.to_string_lossy();
        self.git_ok(&["worktree", "remove", &path_str]).await
    }

    async fn worktree_branch(&self, path: &Path) -> Result<Option<String>, DriverError> {
        let result = self.git(&["worktree", "list", "--porcelain"]).await?;
        if !result.succeeded() {
            return Ok(None);
        }
        let wanted = path.to_path_buf();
        Ok(Self::parse_worktree_list(&result.output)
            .into_iter()
            .find(|(worktree_path, _)| worktree_path == &wanted)
            .and_then(|(_, branch)| branch))
    }

    async fn rev_parse(&self, rev: &str) -> Result<Option<String>, DriverError> {
        let result = self.git(&["rev-parse", "--verify", rev]).await?;
        if !result.succeeded() {
            return Ok(None);
        }
        let sha = result.output.trim().to_string();
        Ok(if sha.is_empty() { None } else { Some(sha) })
    }

    async fn worktree_head(&self, path: &Path) -> Result<Option<String>, DriverError> {
        let argv = vec![
            "git".to_string(),
            "-C".to_string(),
            path.to_string_lossy().to_string(),
            "rev-parse".to_string(),
            "HEAD".to_string(),
        ];
        let result = run_command(&argv, &self.repo_root, self.timeout, &[]).await?;
        if !result.succeeded() {
            return Ok(None);
        }
        let sha = result.output.trim().to_string();
        Ok(if sha.is_empty() { None } else { Some(sha) })
    }

    async fn merge(&self, base: &str, commit: &str) -> Result<MergeResult, DriverError> {
        // Remember the checked-out branch so the repo is left as found.
        let previous = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let previous_branch = previous
            .succeeded()
            .then(|| previous.output.trim().to_string())
            .filter(|branch| !branch.is_empty() && branch != "HEAD");

        self.git_ok(&["switch", base]).await?;

        let merge = self
            .git(&["merge", "--no-ff", "--no-edit", commit])
            .await?;
        if !merge.succeeded() {
            let _ = self.git(&["merge", "--abort"]).await;
            if let Some(branch) = &previous_branch {
                let _ = self.git(&["switch", branch]).await;
            }
            return Ok(MergeResult::Conflict {
                detail: merge.output.trim().to_string(),
            });
        }

        let head = self.git(&["rev-parse", "HEAD"]).await?;
        let commit_sha = if head.succeeded() {
            head.output.trim().to_string()
        } else {
            commit.to_string()
        };

        if let Some(branch) = &previous_branch {
            let _ = self.git(&["switch", branch]).await;
        }

        Ok(MergeResult::Merged { commit_sha })
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<String, DriverError> {
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let result = self
            .git(&["push", "--porcelain", remote, &refspec])
            .await?;
        if !result.succeeded() {
            return Err(DriverError::failed(format!(
                "git push {remote} {branch} failed: {}",
                result.output.trim()
            )));
        }
        Ok(result.output)
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), DriverError> {
        self.git_ok(&["branch", "-d", branch]).await
    }
}
