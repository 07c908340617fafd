//! Trace-id helpers.
//!
//! A trace id is an opaque correlation token: the API reads it from an
//! inbound header, stores it in the run context metadata, threads it through
//! event payloads, and exports it to spawned driver commands. Ids are capped
//! so a hostile header cannot bloat the event log.

const MAX_TRACE_ID_LEN: usize = 128;

/// Trim and length-cap a caller-supplied trace id. Empty input becomes `None`.
pub fn normalize_trace_id(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() > MAX_TRACE_ID_LEN {
        return Some(trimmed[..MAX_TRACE_ID_LEN].to_string());
    }
    Some(trimmed.to_string())
}

/// A fresh trace id for requests that arrive without one.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The caller's trace id if usable, otherwise a generated one.
pub fn ensure_trace_id(value: Option<&str>) -> String {
    normalize_trace_id(value).unwrap_or_else(generate_trace_id)
}
