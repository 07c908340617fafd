//! Row operations for `slot_worktree_bindings`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{format_ts, parse_opt_ts, parse_ts, StoreError, Tx};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotWorktreeBindingRow {
    pub slot_id: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub binding_state: String,
    pub last_action: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl SlotWorktreeBindingRow {
    pub fn is_active(&self) -> bool {
        self.binding_state == "active"
    }
}

fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawBinding> {
    Ok(RawBinding {
        slot_id: row.get(0)?,
        run_id: row.get(1)?,
        branch_name: row.get(2)?,
        worktree_path: row.get(3)?,
        binding_state: row.get(4)?,
        last_action: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        released_at: row.get(8)?,
    })
}

struct RawBinding {
    slot_id: String,
    run_id: Option<String>,
    branch_name: Option<String>,
    worktree_path: Option<String>,
    binding_state: String,
    last_action: String,
    created_at: String,
    updated_at: String,
    released_at: Option<String>,
}

impl RawBinding {
    fn into_binding(self) -> Result<SlotWorktreeBindingRow, StoreError> {
        Ok(SlotWorktreeBindingRow {
            slot_id: self.slot_id,
            run_id: self.run_id,
            branch_name: self.branch_name,
            worktree_path: self.worktree_path,
            binding_state: self.binding_state,
            last_action: self.last_action,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            released_at: parse_opt_ts(self.released_at)?,
        })
    }
}

const BINDING_COLUMNS: &str = "slot_id, run_id, branch_name, worktree_path, binding_state, \
     last_action, created_at, updated_at, released_at";

impl<'a> Tx<'a> {
    pub fn get_worktree_binding(
        &self,
        slot_id: &str,
    ) -> Result<Option<SlotWorktreeBindingRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {BINDING_COLUMNS} FROM slot_worktree_bindings WHERE slot_id = ?1"
                ),
                params![slot_id],
                row_to_binding,
            )
            .optional()?;
        raw.map(RawBinding::into_binding).transpose()
    }

    pub fn list_worktree_bindings(
        &self,
    ) -> Result<Vec<SlotWorktreeBindingRow>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {BINDING_COLUMNS} FROM slot_worktree_bindings ORDER BY slot_id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_binding)?;
        let mut bindings = Vec::new();
        for raw in rows {
            bindings.push(raw?.into_binding()?);
        }
        Ok(bindings)
    }

    /// Cycle the slot's binding row to `active` for this run.
    pub fn upsert_active_binding(
        &self,
        slot_id: &str,
        run_id: &str,
        branch_name: &str,
        worktree_path: &str,
        last_action: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = format_ts(now);
        self.conn().execute(
            "INSERT INTO slot_worktree_bindings \
             (slot_id, run_id, branch_name, worktree_path, binding_state, last_action, created_at, updated_at, released_at) \
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6, NULL) \
             ON CONFLICT (slot_id) DO UPDATE SET \
                run_id = excluded.run_id, \
                branch_name = excluded.branch_name, \
                worktree_path = excluded.worktree_path, \
                binding_state = 'active', \
                last_action = excluded.last_action, \
                updated_at = excluded.updated_at, \
                released_at = NULL",
            params![slot_id, run_id, branch_name, worktree_path, last_action, ts],
        )?;
        Ok(())
    }

    /// Release the slot's binding row after a successful cleanup.
    pub fn mark_binding_released(
        &self,
        slot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = format_ts(now);
        self.conn().execute(
            "UPDATE slot_worktree_bindings SET \
                run_id = NULL, \
                binding_state = 'released', \
                last_action = 'cleaned_up', \
                updated_at = ?2, \
                released_at = ?2 \
             WHERE slot_id = ?1",
            params![slot_id, ts],
        )?;
        Ok(())
    }
}
