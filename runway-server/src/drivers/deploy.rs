//! Deploy hook, release symlink, health probe, and merge-gate check runner.
//!
//! The deploy driver owns exactly one piece of host state: the `current`
//! symlink under the release root. `current_release` reads it, `switch`
//! re-points it; the merge gate uses the pair to restore the previous release
//! when a reload or health probe fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    run_command, split_command, CheckRunner, CommandOutput, DeployDriver, DriverError, HealthProbe,
};

const CURRENT_LINK: &str = "current";

pub struct CommandDeployDriver {
    reload_command: String,
    release_root: PathBuf,
    timeout: Duration,
}

impl CommandDeployDriver {
    pub fn new(reload_command: String, release_root: PathBuf, timeout: Duration) -> Self {
        Self {
            reload_command,
            release_root,
            timeout,
        }
    }

    fn current_link_path(&self) -> PathBuf {
        self.release_root.join(CURRENT_LINK)
    }
}

#[async_trait]
impl DeployDriver for CommandDeployDriver {
    async fn reload(&self, commit_sha: &str) -> Result<CommandOutput, DriverError> {
        let argv = split_command(&self.reload_command)?;
        run_command(
            &argv,
            &self.release_root,
            self.timeout,
            &[("RELEASE_SHA", commit_sha)],
        )
        .await
    }

    async fn current_release(&self) -> Result<Option<String>, DriverError> {
        let link = self.current_link_path();
        match tokio::fs::read_link(&link).await {
            Ok(target) => Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DriverError::failed(format!(
                "read release link {}: {}",
                link.display(),
                e
            ))),
        }
    }

    async fn switch(&self, release_id: &str) -> Result<(), DriverError> {
        let link = self.current_link_path();
        let target = self.release_root.join(release_id);
        tokio::fs::create_dir_all(&self.release_root)
            .await
            .map_err(|e| DriverError::failed(format!("create release root: {}", e)))?;

        // Replace atomically: link to a temp name, then rename over.
        let staging = self.release_root.join(format!(".{CURRENT_LINK}.tmp"));
        let _ = tokio::fs::remove_file(&staging).await;
        tokio::fs::symlink(&target, &staging)
            .await
            .map_err(|e| DriverError::failed(format!("symlink release: {}", e)))?;
        tokio::fs::rename(&staging, &link)
            .await
            .map_err(|e| DriverError::failed(format!("activate release link: {}", e)))?;
        Ok(())
    }
}

pub struct CommandHealthProbe {
    health_command: String,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandHealthProbe {
    pub fn new(health_command: String, cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            health_command,
            cwd,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for CommandHealthProbe {
    async fn check(&self) -> Result<CommandOutput, DriverError> {
        let argv = split_command(&self.health_command)?;
        run_command(&argv, &self.cwd, self.timeout, &[]).await
    }
}

/// Built-in command for a standard check name, used when no
/// `MERGE_GATE_CHECK_<NAME>_COMMAND` override is configured. Only the three
/// default check names have one; anything else must be configured explicitly.
pub fn default_check_command(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "lint" => Some("cargo check --quiet"),
        "test" => Some("cargo test --quiet"),
        "smoke" => Some("sh -c 'echo smoke-ok'"),
        _ => None,
    }
}

/// Runs named merge-gate checks from configured command lines, falling back
/// to [`default_check_command`] for the standard check names.
pub struct CommandCheckRunner {
    commands: HashMap<String, String>,
    timeout: Duration,
}

impl CommandCheckRunner {
    pub fn new(commands: HashMap<String, String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }
}

#[async_trait]
impl CheckRunner for CommandCheckRunner {
    async fn run_check(&self, name: &str, cwd: &Path) -> Result<CommandOutput, DriverError> {
        let raw = self
            .commands
            .get(name)
            .map(String::as_str)
            .or_else(|| default_check_command(name))
            .ok_or_else(|| {
                DriverError::failed(format!("missing_command_for_required_check:{name}"))
            })?;
        let argv = split_command(raw)?;
        run_command(&argv, cwd, self.timeout, &[("CHECK_NAME", name)]).await
    }
}
