//! Runway control-plane service.
//!
//! The control plane that schedules, owns, and finalizes AI-assisted change
//! runs: the run state machine, the slot lease manager, the worktree binding
//! manager, the preview-DB reset coordinator, and the merge/deploy gate, all
//! sharing one transactional SQLite store and one append-only event/audit
//! log, fronted by a small axum API.
//!
//! External capabilities (git, psql, the deploy hook, the health probe) are
//! consumed through the traits in [`drivers`]; the services never spawn a
//! process themselves.

pub mod allocation;
pub mod api;
pub mod config;
pub mod drivers;
pub mod error;
pub mod merge_gate;
pub mod observability;
pub mod resets;
pub mod runs;
pub mod slots;
pub mod store;
pub mod worktrees;

pub use api::{build_router, AppState};
pub use config::Config;
pub use error::{ApiError, ErrorKind};
pub use store::ControlStore;

use std::sync::Arc;
use std::time::Duration;

use allocation::AllocationOrchestrator;
use drivers::{
    CliGitDriver, CommandCheckRunner, CommandDeployDriver, CommandHealthProbe, PsqlResetDriver,
};
use merge_gate::MergeGate;
use resets::ResetCoordinator;
use runs::RunService;
use slots::SlotLeaseManager;
use worktrees::WorktreeManager;

/// Wire the production drivers and services onto a store.
pub fn build_app_state(config: Config, store: ControlStore) -> Arc<AppState> {
    let config = Arc::new(config);
    let store = Arc::new(store);

    let step_timeout = Duration::from_secs(config.deploy_step_timeout_seconds);
    let check_timeout = Duration::from_secs(config.merge_gate_check_timeout_seconds);

    let git = Arc::new(CliGitDriver::new(config.repo_root.clone(), step_timeout));
    let dbreset = Arc::new(PsqlResetDriver::new(config.repo_root.clone(), step_timeout));
    let deploy = Arc::new(CommandDeployDriver::new(
        config.deploy_reload_command.clone(),
        config.release_root.clone(),
        step_timeout,
    ));
    let health = Arc::new(CommandHealthProbe::new(
        config.deploy_health_command.clone(),
        config.repo_root.clone(),
        step_timeout,
    ));
    let checks = Arc::new(CommandCheckRunner::new(
        config.merge_gate_check_commands.clone(),
        check_timeout,
    ));

    let worktrees = Arc::new(WorktreeManager::new(
        store.clone(),
        config.clone(),
        git.clone(),
    ));
    let slots = Arc::new(SlotLeaseManager::new(store.clone(), config.clone()));
    let resets = Arc::new(ResetCoordinator::new(
        store.clone(),
        config.clone(),
        dbreset,
    ));
    let allocation =
        AllocationOrchestrator::new(slots.clone(), worktrees.clone(), resets.clone());
    let merge_gate = MergeGate::new(
        store.clone(),
        config.clone(),
        git,
        deploy,
        health,
        checks,
        worktrees.clone(),
    );
    let runs = RunService::new(store.clone(), worktrees.clone());

    Arc::new(AppState {
        config,
        store,
        runs,
        slots,
        worktrees,
        resets,
        allocation,
        merge_gate,
    })
}
