//! Per-request trace propagation.
//!
//! The trace id travels as a tokio task-local: the API middleware scopes each
//! handler invocation with the inbound (or generated) id, services read it
//! when appending events, and `drivers::run_command` exports it to spawned
//! processes as `TRACE_ID`. Code running outside a scoped task simply sees
//! `None`.

use std::future::Future;

tokio::task_local! {
    static CURRENT_TRACE_ID: Option<String>;
}

/// The trace id of the current request, if the task is inside a trace scope.
pub fn current_trace_id() -> Option<String> {
    CURRENT_TRACE_ID
        .try_with(|trace_id| trace_id.clone())
        .ok()
        .flatten()
}

/// Run a future with the given trace id visible to everything it awaits.
pub async fn with_trace_id<F: Future>(trace_id: Option<String>, f: F) -> F::Output {
    CURRENT_TRACE_ID.scope(trace_id, f).await
}
