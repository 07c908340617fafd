//! Row operations for `slot_leases`.
//!
//! One row per configured slot, cycled in place. The lease manager owns all
//! state changes here; everything else only reads.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{format_ts, parse_opt_ts, StoreError, Tx};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotLeaseRow {
    pub slot_id: String,
    pub run_id: Option<String>,
    pub lease_state: String,
    pub leased_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl SlotLeaseRow {
    /// A lease that is marked `leased` and has not passed its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.lease_state == "leased"
            && self.expires_at.map(|expires| expires > now).unwrap_or(false)
    }

    /// Marked `leased` but past expiry; reapable.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.lease_state == "leased" && !self.is_active(now)
    }
}

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLease> {
    Ok(RawLease {
        slot_id: row.get(0)?,
        run_id: row.get(1)?,
        lease_state: row.get(2)?,
        leased_at: row.get(3)?,
        expires_at: row.get(4)?,
        heartbeat_at: row.get(5)?,
    })
}

struct RawLease {
    slot_id: String,
    run_id: Option<String>,
    lease_state: String,
    leased_at: Option<String>,
    expires_at: Option<String>,
    heartbeat_at: Option<String>,
}

impl RawLease {
    fn into_lease(self) -> Result<SlotLeaseRow, StoreError> {
        Ok(SlotLeaseRow {
            slot_id: self.slot_id,
            run_id: self.run_id,
            lease_state: self.lease_state,
            leased_at: parse_opt_ts(self.leased_at)?,
            expires_at: parse_opt_ts(self.expires_at)?,
            heartbeat_at: parse_opt_ts(self.heartbeat_at)?,
        })
    }
}

const LEASE_COLUMNS: &str = "slot_id, run_id, lease_state, leased_at, expires_at, heartbeat_at";

impl<'a> Tx<'a> {
    /// Insert a `released` row for the slot if none exists.
    pub fn ensure_slot_lease_row(&self, slot_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO slot_leases (slot_id, run_id, lease_state) \
             VALUES (?1, NULL, 'released') \
             ON CONFLICT (slot_id) DO NOTHING",
            params![slot_id],
        )?;
        Ok(())
    }

    pub fn get_slot_lease(&self, slot_id: &str) -> Result<Option<SlotLeaseRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM slot_leases WHERE slot_id = ?1"),
                params![slot_id],
                row_to_lease,
            )
            .optional()?;
        raw.map(RawLease::into_lease).transpose()
    }

    /// Leases for the given slots, in the given (configured) order. Missing
    /// rows are created as `released` so the scan always sees the full pool.
    pub fn slot_leases_in_order(
        &self,
        slot_ids: &[String],
    ) -> Result<Vec<SlotLeaseRow>, StoreError> {
        let mut leases = Vec::with_capacity(slot_ids.len());
        for slot_id in slot_ids {
            self.ensure_slot_lease_row(slot_id)?;
            let lease = self
                .get_slot_lease(slot_id)?
                .ok_or_else(|| StoreError::corruption("slot lease vanished after ensure"))?;
            leases.push(lease);
        }
        Ok(leases)
    }

    /// The `leased` row owned by this run, if any (active or stale).
    pub fn find_lease_for_run(&self, run_id: &str) -> Result<Option<SlotLeaseRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {LEASE_COLUMNS} FROM slot_leases \
                     WHERE run_id = ?1 AND lease_state = 'leased'"
                ),
                params![run_id],
                row_to_lease,
            )
            .optional()?;
        raw.map(RawLease::into_lease).transpose()
    }

    /// All rows currently marked `leased`.
    pub fn leased_slot_rows(&self) -> Result<Vec<SlotLeaseRow>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM slot_leases WHERE lease_state = 'leased' ORDER BY slot_id"
        ))?;
        let rows = stmt.query_map([], row_to_lease)?;
        let mut leases = Vec::new();
        for raw in rows {
            leases.push(raw?.into_lease()?);
        }
        Ok(leases)
    }

    pub fn mark_slot_leased(
        &self,
        slot_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_slot_lease_row(slot_id)?;
        self.conn().execute(
            "UPDATE slot_leases SET run_id = ?2, lease_state = 'leased', \
             leased_at = ?3, expires_at = ?4, heartbeat_at = ?3 WHERE slot_id = ?1",
            params![slot_id, run_id, format_ts(now), format_ts(expires_at)],
        )?;
        Ok(())
    }

    pub fn mark_slot_released(&self, slot_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE slot_leases SET run_id = NULL, lease_state = 'released', \
             leased_at = NULL, expires_at = ?2, heartbeat_at = ?2 WHERE slot_id = ?1",
            params![slot_id, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn mark_slot_expired(&self, slot_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE slot_leases SET run_id = NULL, lease_state = 'expired', \
             heartbeat_at = ?2 WHERE slot_id = ?1",
            params![slot_id, format_ts(now)],
        )?;
        Ok(())
    }

    pub fn touch_slot_heartbeat(
        &self,
        slot_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE slot_leases SET heartbeat_at = ?2, expires_at = ?3 WHERE slot_id = ?1",
            params![slot_id, format_ts(now), format_ts(expires_at)],
        )?;
        Ok(())
    }
}
