//! The preview-slot contract.
//!
//! Slots are a small fixed pool named `preview-<n>`. Each slot owns exactly
//! one preview database, `app_preview_<n>`, and one worktree directory. The
//! functions here are the only way slot ids, database names, and branch names
//! are derived; anything that fails these checks must be rejected before any
//! side effect happens.

use std::fmt;

/// Prefix for per-run branches. The full form is `codex/run-<run_id>`.
pub const BRANCH_PREFIX: &str = "codex/run-";

/// Required prefix of every preview database name. A reset targeting a
/// database outside this namespace is never executed.
pub const PREVIEW_DB_PREFIX: &str = "app_preview_";

/// Violations of the slot contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotContractError {
    InvalidSlotId { slot_id: String },
    InvalidRunIdForBranch { run_id: String },
    MissingDatabaseName,
    NonPreviewDatabaseTarget { db_name: String },
    SlotDatabaseMismatch { expected: String, actual: String },
}

impl fmt::Display for SlotContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotContractError::InvalidSlotId { slot_id } => {
                write!(f, "invalid slot id '{}'", slot_id)
            }
            SlotContractError::InvalidRunIdForBranch { run_id } => {
                write!(f, "run id '{}' is not valid for branch naming", run_id)
            }
            SlotContractError::MissingDatabaseName => write!(f, "missing database name"),
            SlotContractError::NonPreviewDatabaseTarget { db_name } => {
                write!(f, "non-preview database target '{}'", db_name)
            }
            SlotContractError::SlotDatabaseMismatch { expected, actual } => {
                write!(
                    f,
                    "slot database mismatch: expected '{}', actual '{}'",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for SlotContractError {}

/// Normalize a slot id to its canonical `preview-<n>` form.
///
/// Accepts the historical compact spelling (`preview1`) and mixed case, and
/// rejects everything that is not one of the three known slots.
pub fn normalize_slot_id(slot_id: &str) -> Result<String, SlotContractError> {
    let trimmed = slot_id.trim().to_ascii_lowercase();
    let n = match trimmed.as_str() {
        "preview-1" | "preview1" => 1,
        "preview-2" | "preview2" => 2,
        "preview-3" | "preview3" => 3,
        _ => {
            return Err(SlotContractError::InvalidSlotId {
                slot_id: slot_id.to_string(),
            })
        }
    };
    Ok(format!("preview-{}", n))
}

/// The numeric suffix of a canonical slot id.
pub fn slot_number(slot_id: &str) -> Result<u32, SlotContractError> {
    let canonical = normalize_slot_id(slot_id)?;
    canonical
        .rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .ok_or_else(|| SlotContractError::InvalidSlotId {
            slot_id: slot_id.to_string(),
        })
}

/// The preview database dedicated to a slot: `app_preview_<n>`.
pub fn expected_preview_db_name(slot_id: &str) -> Result<String, SlotContractError> {
    Ok(format!("{}{}", PREVIEW_DB_PREFIX, slot_number(slot_id)?))
}

/// Assert that `db_name` is exactly the preview database belonging to
/// `slot_id`. Returns the canonical database name on success.
///
/// This is the hard safety gate in front of every reset: a mismatch (and in
/// particular any attempt to point at the control-plane database) fails here
/// before any SQL is issued.
pub fn assert_preview_slot_database(
    slot_id: &str,
    db_name: &str,
) -> Result<String, SlotContractError> {
    let expected = expected_preview_db_name(slot_id)?;
    let actual = db_name.trim();
    if actual.is_empty() {
        return Err(SlotContractError::MissingDatabaseName);
    }
    if !actual.starts_with(PREVIEW_DB_PREFIX) {
        return Err(SlotContractError::NonPreviewDatabaseTarget {
            db_name: actual.to_string(),
        });
    }
    if actual != expected {
        return Err(SlotContractError::SlotDatabaseMismatch {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(expected)
}

/// Whether a run id is usable in identifiers (branch names, paths).
pub fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Canonical branch for a run: `codex/run-<run_id>`.
pub fn branch_name_for_run(run_id: &str) -> Result<String, SlotContractError> {
    if !is_valid_run_id(run_id) {
        return Err(SlotContractError::InvalidRunIdForBranch {
            run_id: run_id.to_string(),
        });
    }
    Ok(format!("{}{}", BRANCH_PREFIX, run_id))
}
