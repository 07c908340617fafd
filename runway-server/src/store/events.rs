//! Append-only logs: run events, audit entries, validation checks,
//! artifacts, and approvals.
//!
//! Nothing in this module updates or deletes a row. Event payloads are
//! normalized to carry a positive `schema_version`; audit entries store a
//! SHA-256 hash of the canonical payload JSON alongside the payload itself.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use runway_core::RunState;

use super::{format_ts, parse_opt_json, parse_opt_ts, parse_ts, StoreError, Tx};

/// Version stamped into event payloads that do not carry one.
pub const EVENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct RunEventRow {
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to append one run event, with optional audit mirroring.
#[derive(Debug, Clone)]
pub struct AppendRunEvent<'e> {
    pub run_id: &'e str,
    pub event_type: &'e str,
    pub status_from: Option<RunState>,
    pub status_to: Option<RunState>,
    pub payload: Option<Value>,
    pub actor: Option<&'e str>,
    /// When set, an audit entry with this action is written in the same
    /// transaction, carrying the event's identity and payload.
    pub audit_action: Option<&'e str>,
    pub trace_id: Option<&'e str>,
}

impl<'e> AppendRunEvent<'e> {
    pub fn new(run_id: &'e str, event_type: &'e str) -> Self {
        Self {
            run_id,
            event_type,
            status_from: None,
            status_to: None,
            payload: None,
            actor: None,
            audit_action: None,
            trace_id: None,
        }
    }

    pub fn status(mut self, from: Option<RunState>, to: Option<RunState>) -> Self {
        self.status_from = from;
        self.status_to = to;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn actor(mut self, actor: Option<&'e str>) -> Self {
        self.actor = actor;
        self
    }

    pub fn audit(mut self, action: &'e str) -> Self {
        self.audit_action = Some(action);
        self
    }

    pub fn trace(mut self, trace_id: Option<&'e str>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationCheckRow {
    pub id: i64,
    pub run_id: String,
    pub check_name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifactRow {
    pub id: i64,
    pub run_id: String,
    pub artifact_type: String,
    pub artifact_uri: String,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRow {
    pub id: i64,
    pub run_id: String,
    pub reviewer_id: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
    pub failure_reason_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ensure the payload object carries a positive integer `schema_version`.
pub fn normalize_event_payload(payload: Option<Value>, trace_id: Option<&str>) -> Value {
    let mut map = match payload {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("detail".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    let has_version = map
        .get("schema_version")
        .and_then(Value::as_i64)
        .map(|v| v > 0)
        .unwrap_or(false);
    if !has_version {
        map.insert("schema_version".to_string(), json!(EVENT_SCHEMA_VERSION));
    }
    if let Some(trace_id) = trace_id {
        map.entry("trace_id".to_string())
            .or_insert_with(|| Value::String(trace_id.to_string()));
    }
    Value::Object(map)
}

/// SHA-256 over the compact JSON encoding. `serde_json` maps iterate in
/// sorted key order, so equal payloads hash equally.
pub fn payload_hash(payload: &Value) -> String {
    let body = payload.to_string();
    let digest = Sha256::digest(body.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

impl<'a> Tx<'a> {
    /// Append one run event (and optionally its audit mirror). Returns the
    /// event id.
    pub fn append_run_event(
        &self,
        event: AppendRunEvent<'_>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let payload = normalize_event_payload(event.payload.clone(), event.trace_id);
        self.conn().execute(
            "INSERT INTO run_events (run_id, event_type, status_from, status_to, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.run_id,
                event.event_type,
                event.status_from.map(|s| s.as_str()),
                event.status_to.map(|s| s.as_str()),
                payload.to_string(),
                format_ts(now),
            ],
        )?;
        let event_id = self.conn().last_insert_rowid();

        if let Some(action) = event.audit_action {
            let audit_payload = json!({
                "run_id": event.run_id,
                "event_type": event.event_type,
                "status_from": event.status_from.map(|s| s.as_str()),
                "status_to": event.status_to.map(|s| s.as_str()),
                "payload": payload,
            });
            self.append_audit(
                event.actor,
                action,
                &audit_payload,
                AuditKeys {
                    run_id: Some(event.run_id),
                    slot_id: None,
                    commit_sha: None,
                    trace_id: event.trace_id,
                },
                now,
            )?;
        }

        Ok(event_id)
    }

    /// Append an audit entry with correlation keys.
    pub fn append_audit(
        &self,
        actor: Option<&str>,
        action: &str,
        payload: &Value,
        keys: AuditKeys<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO audit_log (actor, action, payload_hash, payload, run_id, slot_id, commit_sha, trace_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                actor,
                action,
                payload_hash(payload),
                payload.to_string(),
                keys.run_id,
                keys.slot_id,
                keys.commit_sha,
                keys.trace_id,
                format_ts(now),
            ],
        )?;
        Ok(())
    }

    /// Events for a run, ordered by `(created_at, id)`.
    pub fn list_run_events(
        &self,
        run_id: &str,
        limit: u32,
    ) -> Result<Vec<RunEventRow>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, run_id, event_type, status_from, status_to, payload, created_at \
             FROM run_events WHERE run_id = ?1 \
             ORDER BY created_at ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, run_id, event_type, status_from, status_to, payload, created_at) = row?;
            events.push(RunEventRow {
                id,
                run_id,
                event_type,
                status_from,
                status_to,
                payload: parse_opt_json(payload)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(events)
    }

    pub fn insert_validation_check(
        &self,
        run_id: &str,
        check_name: &str,
        status: &str,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        artifact_uri: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO validation_checks (run_id, check_name, status, started_at, ended_at, artifact_uri) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                check_name,
                status,
                started_at.map(format_ts),
                ended_at.map(format_ts),
                artifact_uri,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_validation_checks(
        &self,
        run_id: &str,
        limit: u32,
    ) -> Result<Vec<ValidationCheckRow>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, run_id, check_name, status, started_at, ended_at, artifact_uri \
             FROM validation_checks WHERE run_id = ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut checks = Vec::new();
        for row in rows {
            let (id, run_id, check_name, status, started_at, ended_at, artifact_uri) = row?;
            checks.push(ValidationCheckRow {
                id,
                run_id,
                check_name,
                status,
                started_at: parse_opt_ts(started_at)?,
                ended_at: parse_opt_ts(ended_at)?,
                artifact_uri,
            });
        }
        Ok(checks)
    }

    pub fn insert_run_artifact(
        &self,
        run_id: &str,
        artifact_type: &str,
        artifact_uri: &str,
        payload: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO run_artifacts (run_id, artifact_type, artifact_uri, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                artifact_type,
                artifact_uri,
                payload.map(|p| p.to_string()),
                format_ts(now),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_run_artifacts(
        &self,
        run_id: &str,
        limit: u32,
    ) -> Result<Vec<RunArtifactRow>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, run_id, artifact_type, artifact_uri, payload, created_at \
             FROM run_artifacts WHERE run_id = ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut artifacts = Vec::new();
        for row in rows {
            let (id, run_id, artifact_type, artifact_uri, payload, created_at) = row?;
            artifacts.push(RunArtifactRow {
                id,
                run_id,
                artifact_type,
                artifact_uri,
                payload: parse_opt_json(payload)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(artifacts)
    }

    pub fn insert_approval(
        &self,
        run_id: &str,
        reviewer_id: Option<&str>,
        decision: &str,
        reason: Option<&str>,
        failure_reason_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRow, StoreError> {
        self.conn().execute(
            "INSERT INTO approvals (run_id, reviewer_id, decision, reason, failure_reason_code, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                reviewer_id,
                decision,
                reason,
                failure_reason_code,
                format_ts(now),
            ],
        )?;
        Ok(ApprovalRow {
            id: self.conn().last_insert_rowid(),
            run_id: run_id.to_string(),
            reviewer_id: reviewer_id.map(str::to_string),
            decision: decision.to_string(),
            reason: reason.map(str::to_string),
            failure_reason_code: failure_reason_code.map(str::to_string),
            created_at: now,
        })
    }

    pub fn list_approvals(&self, run_id: &str) -> Result<Vec<ApprovalRow>, StoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, run_id, reviewer_id, decision, reason, failure_reason_code, created_at \
             FROM approvals WHERE run_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut approvals = Vec::new();
        for row in rows {
            let (id, run_id, reviewer_id, decision, reason, failure_reason_code, created_at) =
                row?;
            approvals.push(ApprovalRow {
                id,
                run_id,
                reviewer_id,
                decision,
                reason,
                failure_reason_code,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(approvals)
    }
}

/// Correlation keys attached to audit entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditKeys<'k> {
    pub run_id: Option<&'k str>,
    pub slot_id: Option<&'k str>,
    pub commit_sha: Option<&'k str>,
    pub trace_id: Option<&'k str>,
}
