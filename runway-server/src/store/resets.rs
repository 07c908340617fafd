//! Row operations for `preview_db_resets`, the append-only provenance log
//! of every reset attempt, including rejected and dry-run ones.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{format_ts, parse_opt_json, parse_opt_ts, parse_ts, StoreError, Tx};

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewDbResetRow {
    pub id: i64,
    pub run_id: String,
    pub slot_id: String,
    pub db_name: String,
    pub strategy: String,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    pub reset_status: String,
    pub details: Option<Value>,
    pub reset_started_at: DateTime<Utc>,
    pub reset_completed_at: Option<DateTime<Utc>>,
}

const RESET_COLUMNS: &str = "id, run_id, slot_id, db_name, strategy, seed_version, \
     snapshot_version, reset_status, details, reset_started_at, reset_completed_at";

fn row_to_reset(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawReset> {
    Ok(RawReset {
        id: row.get(0)?,
        run_id: row.get(1)?,
        slot_id: row.get(2)?,
        db_name: row.get(3)?,
        strategy: row.get(4)?,
        seed_version: row.get(5)?,
        snapshot_version: row.get(6)?,
        reset_status: row.get(7)?,
        details: row.get(8)?,
        reset_started_at: row.get(9)?,
        reset_completed_at: row.get(10)?,
    })
}

struct RawReset {
    id: i64,
    run_id: String,
    slot_id: String,
    db_name: String,
    strategy: String,
    seed_version: Option<String>,
    snapshot_version: Option<String>,
    reset_status: String,
    details: Option<String>,
    reset_started_at: String,
    reset_completed_at: Option<String>,
}

impl RawReset {
    fn into_reset(self) -> Result<PreviewDbResetRow, StoreError> {
        Ok(PreviewDbResetRow {
            id: self.id,
            run_id: self.run_id,
            slot_id: self.slot_id,
            db_name: self.db_name,
            strategy: self.strategy,
            seed_version: self.seed_version,
            snapshot_version: self.snapshot_version,
            reset_status: self.reset_status,
            details: parse_opt_json(self.details)?,
            reset_started_at: parse_ts(&self.reset_started_at)?,
            reset_completed_at: parse_opt_ts(self.reset_completed_at)?,
        })
    }
}

impl<'a> Tx<'a> {
    /// Record a finished reset attempt (any terminal status). One row per
    /// attempt; rows are never updated afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_preview_db_reset(
        &self,
        run_id: &str,
        slot_id: &str,
        db_name: &str,
        strategy: &str,
        seed_version: Option<&str>,
        snapshot_version: Option<&str>,
        reset_status: &str,
        details: &Value,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        self.conn().execute(
            "INSERT INTO preview_db_resets \
             (run_id, slot_id, db_name, strategy, seed_version, snapshot_version, \
              reset_status, details, reset_started_at, reset_completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run_id,
                slot_id,
                db_name,
                strategy,
                seed_version,
                snapshot_version,
                reset_status,
                details.to_string(),
                format_ts(started_at),
                completed_at.map(format_ts),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_preview_db_reset(
        &self,
        id: i64,
    ) -> Result<Option<PreviewDbResetRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {RESET_COLUMNS} FROM preview_db_resets WHERE id = ?1"),
                params![id],
                row_to_reset,
            )
            .optional()?;
        raw.map(RawReset::into_reset).transpose()
    }

    pub fn list_preview_db_resets_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<PreviewDbResetRow>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {RESET_COLUMNS} FROM preview_db_resets WHERE run_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], row_to_reset)?;
        let mut resets = Vec::new();
        for raw in rows {
            resets.push(raw?.into_reset()?);
        }
        Ok(resets)
    }
}
