//! Domain rules for the Runway change pipeline.
//!
//! This crate holds the pure, I/O-free parts of the control plane:
//! - the run state machine (states, failure taxonomy, transition table),
//! - the preview-slot contract (slot ids, slot-to-database mapping,
//!   branch naming),
//! - trace-id helpers shared by the API layer and the drivers.
//!
//! The server crate enforces these rules against the control store; nothing
//! here touches a database, a filesystem, or a subprocess.

pub mod slot;
pub mod state;
pub mod trace;

pub use slot::{
    assert_preview_slot_database, branch_name_for_run, expected_preview_db_name, is_valid_run_id,
    normalize_slot_id, slot_number, SlotContractError, BRANCH_PREFIX, PREVIEW_DB_PREFIX,
};
pub use state::{
    ensure_transition_allowed, list_failure_reason_codes, list_run_states, FailureReasonCode,
    RunState, TransitionRuleError,
};
pub use trace::{ensure_trace_id, generate_trace_id, normalize_trace_id};
