//! The run state machine.
//!
//! A run moves from `queued` to exactly one of the four terminal states
//! (`merged`, `failed`, `canceled`, `expired`). The transition table below is
//! the single authority for which moves are legal; every component that wants
//! to change a run's status goes through `ensure_transition_allowed` first.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical lifecycle states for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Planning,
    Editing,
    Testing,
    PreviewReady,
    NeedsApproval,
    Approved,
    Merging,
    Deploying,
    Merged,
    Failed,
    Canceled,
    Expired,
}

impl RunState {
    /// All states, in lifecycle order.
    pub const ALL: [RunState; 13] = [
        RunState::Queued,
        RunState::Planning,
        RunState::Editing,
        RunState::Testing,
        RunState::PreviewReady,
        RunState::NeedsApproval,
        RunState::Approved,
        RunState::Merging,
        RunState::Deploying,
        RunState::Merged,
        RunState::Failed,
        RunState::Canceled,
        RunState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Planning => "planning",
            RunState::Editing => "editing",
            RunState::Testing => "testing",
            RunState::PreviewReady => "preview_ready",
            RunState::NeedsApproval => "needs_approval",
            RunState::Approved => "approved",
            RunState::Merging => "merging",
            RunState::Deploying => "deploying",
            RunState::Merged => "merged",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
            RunState::Expired => "expired",
        }
    }

    /// Terminal runs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Merged | RunState::Failed | RunState::Canceled | RunState::Expired
        )
    }

    /// States a run may legally move to from this one.
    ///
    /// Note that `merging` and `deploying` cannot expire: once the merge gate
    /// owns a run, the only exits are forward, `failed`, or `canceled`.
    pub fn allowed_targets(&self) -> &'static [RunState] {
        match self {
            RunState::Queued => &[
                RunState::Planning,
                RunState::Canceled,
                RunState::Failed,
                RunState::Expired,
            ],
            RunState::Planning => &[
                RunState::Editing,
                RunState::Canceled,
                RunState::Failed,
                RunState::Expired,
            ],
            RunState::Editing => &[
                RunState::Testing,
                RunState::Canceled,
                RunState::Failed,
                RunState::Expired,
            ],
            RunState::Testing => &[
                RunState::PreviewReady,
                RunState::Failed,
                RunState::Canceled,
                RunState::Expired,
            ],
            RunState::PreviewReady => &[
                RunState::NeedsApproval,
                RunState::Failed,
                RunState::Canceled,
                RunState::Expired,
            ],
            RunState::NeedsApproval => &[
                RunState::Approved,
                RunState::Failed,
                RunState::Canceled,
                RunState::Expired,
            ],
            RunState::Approved => &[
                RunState::Merging,
                RunState::Failed,
                RunState::Canceled,
                RunState::Expired,
            ],
            RunState::Merging => &[RunState::Deploying, RunState::Failed, RunState::Canceled],
            RunState::Deploying => &[RunState::Merged, RunState::Failed, RunState::Canceled],
            RunState::Merged | RunState::Failed | RunState::Canceled | RunState::Expired => &[],
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = UnknownValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownValueError {
                what: "run state",
                value: s.to_string(),
            })
    }
}

/// Machine-readable reason attached to every transition into `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReasonCode {
    WaitingForSlot,
    ValidationFailed,
    ChecksFailed,
    MergeConflict,
    MigrationFailed,
    DeployHealthcheckFailed,
    DeployPushFailed,
    PreviewPublishFailed,
    AgentTimeout,
    AgentCanceled,
    PreviewExpired,
    PolicyRejected,
    UnknownError,
}

impl FailureReasonCode {
    pub const ALL: [FailureReasonCode; 13] = [
        FailureReasonCode::WaitingForSlot,
        FailureReasonCode::ValidationFailed,
        FailureReasonCode::ChecksFailed,
        FailureReasonCode::MergeConflict,
        FailureReasonCode::MigrationFailed,
        FailureReasonCode::DeployHealthcheckFailed,
        FailureReasonCode::DeployPushFailed,
        FailureReasonCode::PreviewPublishFailed,
        FailureReasonCode::AgentTimeout,
        FailureReasonCode::AgentCanceled,
        FailureReasonCode::PreviewExpired,
        FailureReasonCode::PolicyRejected,
        FailureReasonCode::UnknownError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReasonCode::WaitingForSlot => "WAITING_FOR_SLOT",
            FailureReasonCode::ValidationFailed => "VALIDATION_FAILED",
            FailureReasonCode::ChecksFailed => "CHECKS_FAILED",
            FailureReasonCode::MergeConflict => "MERGE_CONFLICT",
            FailureReasonCode::MigrationFailed => "MIGRATION_FAILED",
            FailureReasonCode::DeployHealthcheckFailed => "DEPLOY_HEALTHCHECK_FAILED",
            FailureReasonCode::DeployPushFailed => "DEPLOY_PUSH_FAILED",
            FailureReasonCode::PreviewPublishFailed => "PREVIEW_PUBLISH_FAILED",
            FailureReasonCode::AgentTimeout => "AGENT_TIMEOUT",
            FailureReasonCode::AgentCanceled => "AGENT_CANCELED",
            FailureReasonCode::PreviewExpired => "PREVIEW_EXPIRED",
            FailureReasonCode::PolicyRejected => "POLICY_REJECTED",
            FailureReasonCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for FailureReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReasonCode {
    type Err = UnknownValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureReasonCode::ALL
            .iter()
            .find(|code| code.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownValueError {
                what: "failure reason code",
                value: s.to_string(),
            })
    }
}

/// Parse error for states and failure codes read back from storage or the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownValueError {
    pub what: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: '{}'", self.what, self.value)
    }
}

impl std::error::Error for UnknownValueError {}

/// Why a requested transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRuleError {
    /// The run is already in a terminal state.
    TerminalState { current: RunState },
    /// The `(from, to)` pair is not in the transition table.
    NotAllowed { current: RunState, target: RunState },
    /// A transition to `failed` must carry a failure reason code.
    MissingFailureReason,
    /// Only transitions to `failed` may carry a failure reason code.
    UnexpectedFailureReason { target: RunState },
}

impl fmt::Display for TransitionRuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionRuleError::TerminalState { current } => {
                write!(f, "cannot transition terminal state '{}'", current)
            }
            TransitionRuleError::NotAllowed { current, target } => {
                let allowed: Vec<&str> = current
                    .allowed_targets()
                    .iter()
                    .map(|state| state.as_str())
                    .collect();
                write!(
                    f,
                    "invalid transition '{}' -> '{}'; allowed: [{}]",
                    current,
                    target,
                    allowed.join(", ")
                )
            }
            TransitionRuleError::MissingFailureReason => {
                write!(f, "failure_reason_code is required when transitioning to failed")
            }
            TransitionRuleError::UnexpectedFailureReason { target } => {
                write!(
                    f,
                    "failure_reason_code is only valid for failed transitions (target was '{}')",
                    target
                )
            }
        }
    }
}

impl std::error::Error for TransitionRuleError {}

/// Validate a requested transition against the table and the failure-code
/// discipline. This is the only legality check in the system; callers apply
/// the transition iff this returns `Ok`.
pub fn ensure_transition_allowed(
    current: RunState,
    target: RunState,
    failure_reason: Option<FailureReasonCode>,
) -> Result<(), TransitionRuleError> {
    if current.is_terminal() {
        return Err(TransitionRuleError::TerminalState { current });
    }
    if !current.allowed_targets().contains(&target) {
        return Err(TransitionRuleError::NotAllowed { current, target });
    }
    if target == RunState::Failed && failure_reason.is_none() {
        return Err(TransitionRuleError::MissingFailureReason);
    }
    if target != RunState::Failed && failure_reason.is_some() {
        return Err(TransitionRuleError::UnexpectedFailureReason { target });
    }
    Ok(())
}

/// State names in lifecycle order, for the `/api/runs/contract` endpoint.
pub fn list_run_states() -> Vec<&'static str> {
    RunState::ALL.iter().map(|state| state.as_str()).collect()
}

/// Failure-reason codes, for the `/api/runs/contract` endpoint.
pub fn list_failure_reason_codes() -> Vec<&'static str> {
    FailureReasonCode::ALL.iter().map(|code| code.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in RunState::ALL {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("unknown".parse::<RunState>().is_err());
    }

    #[test]
    fn test_failure_code_round_trips_through_str() {
        for code in FailureReasonCode::ALL {
            assert_eq!(code.as_str().parse::<FailureReasonCode>().unwrap(), code);
        }
        assert!("NOT_A_CODE".parse::<FailureReasonCode>().is_err());
    }

    #[test]
    fn test_terminal_states_have_no_targets() {
        for state in RunState::ALL {
            if state.is_terminal() {
                assert!(state.allowed_targets().is_empty(), "{state} should be terminal");
            } else {
                assert!(!state.allowed_targets().is_empty());
            }
        }
    }

    #[test]
    fn test_happy_path_is_fully_allowed() {
        let path = [
            RunState::Queued,
            RunState::Planning,
            RunState::Editing,
            RunState::Testing,
            RunState::PreviewReady,
            RunState::NeedsApproval,
            RunState::Approved,
            RunState::Merging,
            RunState::Deploying,
            RunState::Merged,
        ];
        for pair in path.windows(2) {
            ensure_transition_allowed(pair[0], pair[1], None)
                .unwrap_or_else(|e| panic!("{} -> {} rejected: {}", pair[0], pair[1], e));
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [
            RunState::Merged,
            RunState::Failed,
            RunState::Canceled,
            RunState::Expired,
        ] {
            for target in RunState::ALL {
                assert_eq!(
                    ensure_transition_allowed(terminal, target, None),
                    Err(TransitionRuleError::TerminalState { current: terminal })
                );
            }
        }
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        assert!(matches!(
            ensure_transition_allowed(RunState::Queued, RunState::Deploying, None),
            Err(TransitionRuleError::NotAllowed { .. })
        ));
        assert!(matches!(
            ensure_transition_allowed(RunState::Editing, RunState::Merged, None),
            Err(TransitionRuleError::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_merging_and_deploying_cannot_expire() {
        assert!(matches!(
            ensure_transition_allowed(RunState::Merging, RunState::Expired, None),
            Err(TransitionRuleError::NotAllowed { .. })
        ));
        assert!(matches!(
            ensure_transition_allowed(RunState::Deploying, RunState::Expired, None),
            Err(TransitionRuleError::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_failed_requires_a_reason_code() {
        assert_eq!(
            ensure_transition_allowed(RunState::Testing, RunState::Failed, None),
            Err(TransitionRuleError::MissingFailureReason)
        );
        ensure_transition_allowed(
            RunState::Testing,
            RunState::Failed,
            Some(FailureReasonCode::ValidationFailed),
        )
        .unwrap();
    }

    #[test]
    fn test_non_failed_rejects_a_reason_code() {
        assert_eq!(
            ensure_transition_allowed(
                RunState::Queued,
                RunState::Planning,
                Some(FailureReasonCode::UnknownError)
            ),
            Err(TransitionRuleError::UnexpectedFailureReason {
                target: RunState::Planning
            })
        );
    }

    #[test]
    fn test_contract_listings_are_complete() {
        assert_eq!(list_run_states().len(), 13);
        assert_eq!(list_failure_reason_codes().len(), 13);
        assert_eq!(list_run_states()[0], "queued");
        assert!(list_failure_reason_codes().contains(&"PREVIEW_EXPIRED"));
    }
}
