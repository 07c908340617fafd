//! Row operations for `runs` and `run_context`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use runway_core::{FailureReasonCode, RunState};

use super::{format_ts, parse_opt_json, parse_ts, StoreError, Tx};

/// A run as persisted. Status is parsed eagerly so callers never see a raw
/// string that might not be a legal state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub status: RunState,
    pub route: Option<String>,
    pub slot_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub commit_sha: Option<String>,
    pub parent_run_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub route: Option<String>,
    pub created_by: Option<String>,
    pub parent_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunContextRow {
    pub run_id: String,
    pub route: Option<String>,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
}

/// Filters for the run list endpoint.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub statuses: Vec<RunState>,
    /// Normalized route path; matches the route itself and its descendants.
    pub route: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

const RUN_COLUMNS: &str = "id, title, prompt, status, route, slot_id, branch_name, \
     worktree_path, commit_sha, parent_run_id, created_by, created_at, updated_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        title: row.get(1)?,
        prompt: row.get(2)?,
        status: row.get(3)?,
        route: row.get(4)?,
        slot_id: row.get(5)?,
        branch_name: row.get(6)?,
        worktree_path: row.get(7)?,
        commit_sha: row.get(8)?,
        parent_run_id: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

struct RawRun {
    id: String,
    title: String,
    prompt: String,
    status: String,
    route: Option<String>,
    slot_id: Option<String>,
    branch_name: Option<String>,
    worktree_path: Option<String>,
    commit_sha: Option<String>,
    parent_run_id: Option<String>,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRun {
    fn into_run(self) -> Result<RunRow, StoreError> {
        let status = self
            .status
            .parse::<RunState>()
            .map_err(StoreError::corruption)?;
        Ok(RunRow {
            id: self.id,
            title: self.title,
            prompt: self.prompt,
            status,
            route: self.route,
            slot_id: self.slot_id,
            branch_name: self.branch_name,
            worktree_path: self.worktree_path,
            commit_sha: self.commit_sha,
            parent_run_id: self.parent_run_id,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl<'a> Tx<'a> {
    pub fn insert_run(&self, new: &NewRun, now: DateTime<Utc>) -> Result<RunRow, StoreError> {
        let ts = format_ts(now);
        self.conn().execute(
            &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, NULL, ?6, ?7, ?8, ?8)"),
            params![
                new.id,
                new.title,
                new.prompt,
                RunState::Queued.as_str(),
                new.route,
                new.parent_run_id,
                new.created_by,
                ts,
            ],
        )?;
        self.get_run(&new.id)?
            .ok_or_else(|| StoreError::corruption("run vanished after insert"))
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![run_id],
                row_to_run,
            )
            .optional()?;
        raw.map(RawRun::into_run).transpose()
    }

    /// List runs matching the filter, newest first, plus the unpaged total.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<(Vec<RunRow>, u64), StoreError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = filter
                .statuses
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 1))
                .collect();
            conditions.push(format!("status IN ({})", placeholders.join(", ")));
            for status in &filter.statuses {
                args.push(Box::new(status.as_str().to_string()));
            }
        }
        if let Some(route) = &filter.route {
            let idx = args.len();
            conditions.push(format!(
                "(route = ?{} OR route LIKE ?{} OR ?{} LIKE route || '/%')",
                idx + 1,
                idx + 2,
                idx + 3
            ));
            args.push(Box::new(route.clone()));
            args.push(Box::new(format!("{}/%", route)));
            args.push(Box::new(route.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            args.iter().map(|p| p.as_ref()).collect();

        let total: u64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM runs{where_clause}"),
            params_refs.as_slice(),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs{where_clause} \
             ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            filter.limit, filter.offset
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), row_to_run)?;

        let mut runs = Vec::new();
        for raw in rows {
            runs.push(raw?.into_run()?);
        }
        Ok((runs, total))
    }

    /// Apply a validated status change. Legality is the caller's problem;
    /// this only writes.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, status.as_str(), format_ts(now)],
        )?;
        Ok(())
    }

    pub fn set_run_slot(
        &self,
        run_id: &str,
        slot_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE runs SET slot_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, slot_id, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn set_run_workspace(
        &self,
        run_id: &str,
        branch_name: Option<&str>,
        worktree_path: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE runs SET branch_name = ?2, worktree_path = ?3, updated_at = ?4 WHERE id = ?1",
            params![run_id, branch_name, worktree_path, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn clear_run_worktree_path(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE runs SET worktree_path = NULL, updated_at = ?2 WHERE id = ?1",
            params![run_id, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn set_run_commit_sha(
        &self,
        run_id: &str,
        commit_sha: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE runs SET commit_sha = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, commit_sha, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn insert_run_context(&self, context: &RunContextRow) -> Result<(), StoreError> {
        let metadata = context
            .metadata
            .as_ref()
            .map(|value| value.to_string());
        self.conn().execute(
            "INSERT INTO run_context (run_id, route, page_title, element_hint, note, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                context.run_id,
                context.route,
                context.page_title,
                context.element_hint,
                context.note,
                metadata,
            ],
        )?;
        Ok(())
    }

    pub fn get_run_context(&self, run_id: &str) -> Result<Option<RunContextRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                "SELECT run_id, route, page_title, element_hint, note, metadata \
                 FROM run_context WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(run_id, route, page_title, element_hint, note, metadata)| {
            Ok(RunContextRow {
                run_id,
                route,
                page_title,
                element_hint,
                note,
                metadata: parse_opt_json(metadata)?,
            })
        })
        .transpose()
    }
}

/// Attach a failure reason to the standard transition-event payload shape.
pub fn failure_payload(code: FailureReasonCode, payload: Option<Value>) -> Value {
    let mut map = match payload {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("detail".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    map.insert(
        "failure_reason_code".to_string(),
        Value::String(code.as_str().to_string()),
    );
    Value::Object(map)
}
