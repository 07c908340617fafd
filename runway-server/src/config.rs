//! Service configuration.
//!
//! All tunables are read from the environment exactly once, in `main`, and
//! the resulting `Config` is handed to each component at construction time.
//! Nothing in the service consults the environment after startup.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default slot pool. The pool size is fixed at deployment time; changing it
/// requires a restart, not an API call.
pub const DEFAULT_SLOT_IDS: [&str; 3] = ["preview-1", "preview-2", "preview-3"];

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory holding the control-plane SQLite database.
    pub state_dir: PathBuf,
    /// Slot scan order for first-fit acquisition.
    pub slot_ids: Vec<String>,
    pub slot_lease_ttl_seconds: u64,
    /// Parent directory of per-slot worktrees (`<worktree_root>/<slot_id>`).
    pub worktree_root: PathBuf,
    /// The canonical clone that branches, merges, and pushes run against.
    pub repo_root: PathBuf,
    pub main_branch: String,
    /// Must render to `app_preview_{n}`; anything else makes every reset
    /// fail the safety gate, which is the intended way to disable resets.
    pub preview_db_name_template: String,
    /// Relative to `repo_root`; `{version}` is substituted.
    pub seed_file_template: String,
    pub snapshot_file_template: String,
    pub deploy_reload_command: String,
    pub deploy_health_command: String,
    pub deploy_step_timeout_seconds: u64,
    /// Re-run the named checks on the exact commit before merging.
    pub merge_gate_recheck_required: bool,
    pub merge_gate_required_checks: Vec<String>,
    pub merge_gate_check_timeout_seconds: u64,
    /// Per-check command overrides, keyed by check name. The standard checks
    /// (`lint`, `test`, `smoke`) fall back to built-in commands when no
    /// override is set; anything else must be configured here.
    pub merge_gate_check_commands: HashMap<String, String>,
    pub git_push_remote: String,
    /// Directory the deploy driver keeps its `current` release symlink in.
    pub release_root: PathBuf,
    /// Where merge-gate and deploy log artifacts are written.
    pub artifact_root: PathBuf,
    pub trace_header_name: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env_or("PORT", "3000")
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = PathBuf::from(env_or("STATE_DIR", "."));

        let mut slot_ids = parse_csv(&env_or("SLOT_IDS", &DEFAULT_SLOT_IDS.join(",")));
        if slot_ids.is_empty() {
            slot_ids = DEFAULT_SLOT_IDS.iter().map(|s| s.to_string()).collect();
        }

        let slot_lease_ttl_seconds = env_or("SLOT_LEASE_TTL_SECONDS", "1800")
            .parse::<u64>()
            .context("SLOT_LEASE_TTL_SECONDS must be a valid number")?
            .max(30);

        let deploy_step_timeout_seconds = env_or("DEPLOY_STEP_TIMEOUT_SECONDS", "120")
            .parse::<u64>()
            .context("DEPLOY_STEP_TIMEOUT_SECONDS must be a valid number")?
            .max(15);

        let merge_gate_check_timeout_seconds = env_or("MERGE_GATE_CHECK_TIMEOUT_SECONDS", "900")
            .parse::<u64>()
            .context("MERGE_GATE_CHECK_TIMEOUT_SECONDS must be a valid number")?
            .max(30);

        let merge_gate_recheck_required = env_or("MERGE_GATE_RECHECK_REQUIRED", "true")
            .parse::<bool>()
            .unwrap_or(true);

        let merge_gate_required_checks =
            parse_csv(&env_or("MERGE_GATE_REQUIRED_CHECKS", "lint,test,smoke"));

        // Check commands come from MERGE_GATE_CHECK_<NAME>_COMMAND; names are
        // upper-cased with non-alphanumerics squashed to underscores.
        let mut merge_gate_check_commands = HashMap::new();
        for name in &merge_gate_required_checks {
            let key = format!("MERGE_GATE_CHECK_{}_COMMAND", check_env_key(name));
            if let Ok(value) = env::var(&key) {
                if !value.trim().is_empty() {
                    merge_gate_check_commands.insert(name.clone(), value);
                }
            }
        }

        let artifact_root = env::var("ARTIFACT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("artifacts").join("runs"));

        Ok(Config {
            port,
            state_dir,
            slot_ids,
            slot_lease_ttl_seconds,
            worktree_root: PathBuf::from(env_or("WORKTREE_ROOT", "/srv/runway/worktrees")),
            repo_root: PathBuf::from(env_or("REPO_ROOT", "/srv/runway/repo")),
            main_branch: env_or("MAIN_BRANCH", "main"),
            preview_db_name_template: env_or("PREVIEW_DB_NAME_TEMPLATE", "app_preview_{n}"),
            seed_file_template: env_or("SEED_FILE_TEMPLATE", "seeds/seed-{version}.sql"),
            snapshot_file_template: env_or(
                "SNAPSHOT_FILE_TEMPLATE",
                "snapshots/snapshot-{version}.sql",
            ),
            deploy_reload_command: env_or(
                "DEPLOY_RELOAD_COMMAND",
                "sudo systemctl reload-or-restart runway-api",
            ),
            deploy_health_command: env_or(
                "DEPLOY_HEALTH_COMMAND",
                "curl -fsS http://127.0.0.1:8000/health",
            ),
            deploy_step_timeout_seconds,
            merge_gate_recheck_required,
            merge_gate_required_checks,
            merge_gate_check_timeout_seconds,
            merge_gate_check_commands,
            git_push_remote: env_or("GIT_PUSH_REMOTE", "origin"),
            release_root: PathBuf::from(env_or("RELEASE_ROOT", "/srv/runway/releases")),
            artifact_root,
            trace_header_name: env_or("TRACE_HEADER_NAME", "X-Trace-Id"),
        })
    }

    /// The slot lease TTL as a chrono duration.
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.slot_lease_ttl_seconds as i64)
    }

    /// Database name a slot's resets must target, from the configured
    /// template. A template without `{n}` renders as-is, which the safety
    /// gate will then reject for every slot.
    pub fn preview_db_name(&self, slot_number: u32) -> String {
        self.preview_db_name_template
            .replace("{n}", &slot_number.to_string())
    }

    /// Absolute seed file path for a seed version.
    pub fn seed_file_path(&self, version: &str) -> PathBuf {
        self.repo_root
            .join(self.seed_file_template.replace("{version}", version))
    }

    /// Absolute snapshot file path for a snapshot version.
    pub fn snapshot_file_path(&self, version: &str) -> PathBuf {
        self.repo_root
            .join(self.snapshot_file_template.replace("{version}", version))
    }

    /// SQLite database file inside the state directory.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("runway.db")
    }

    /// A self-contained config for tests: no-op commands, paths under /tmp,
    /// and the default slot pool. Not used by production wiring.
    pub fn for_tests() -> Self {
        Config {
            port: 0,
            state_dir: PathBuf::from("."),
            slot_ids: DEFAULT_SLOT_IDS.iter().map(|s| s.to_string()).collect(),
            slot_lease_ttl_seconds: 1800,
            worktree_root: PathBuf::from("/tmp/runway-test/worktrees"),
            repo_root: PathBuf::from("/tmp/runway-test/repo"),
            main_branch: "main".to_string(),
            preview_db_name_template: "app_preview_{n}".to_string(),
            seed_file_template: "seeds/seed-{version}.sql".to_string(),
            snapshot_file_template: "snapshots/snapshot-{version}.sql".to_string(),
            deploy_reload_command: "true".to_string(),
            deploy_health_command: "true".to_string(),
            deploy_step_timeout_seconds: 15,
            merge_gate_recheck_required: true,
            merge_gate_required_checks: vec!["lint".to_string(), "test".to_string()],
            merge_gate_check_timeout_seconds: 30,
            merge_gate_check_commands: HashMap::new(),
            git_push_remote: "origin".to_string(),
            release_root: PathBuf::from("/tmp/runway-test/releases"),
            artifact_root: PathBuf::from("/tmp/runway-test/artifacts"),
            trace_header_name: "X-Trace-Id".to_string(),
        }
    }
}

/// `lint` -> `LINT`, `e2e smoke` -> `E2E_SMOKE`.
fn check_env_key(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
