//! SQLite control-plane store.
//!
//! One relational database holds every table in the system: runs, run
//! context, the append-only event and audit logs, validation checks,
//! artifacts, slot leases, worktree bindings, preview-DB reset provenance,
//! approvals, and releases.
//!
//! # Schema versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.
//!
//! # Transactions
//!
//! Every public operation of the services runs in exactly one transaction,
//! obtained through [`ControlStore::with_tx`]. The closure receives a [`Tx`]
//! whose typed row operations live in the sibling modules; returning `Err`
//! rolls the transaction back, returning `Ok` commits it. The
//! `Mutex<Connection>` serializes writers, which is what makes slot
//! acquisition and per-run transitions race-free.

mod events;
mod releases;
mod resets;
mod runs;
mod slots;
mod worktrees;

#[cfg(test)]
mod tests;

pub use events::{
    normalize_event_payload, payload_hash, AppendRunEvent, ApprovalRow, AuditKeys, RunArtifactRow,
    RunEventRow, ValidationCheckRow, EVENT_SCHEMA_VERSION,
};
pub use releases::ReleaseRow;
pub use resets::PreviewDbResetRow;
pub use runs::{failure_payload, NewRun, RunContextRow, RunFilter, RunRow};
pub use slots::SlotLeaseRow;
pub use worktrees::SlotWorktreeBindingRow;

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Error type for store operations.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Storage backend is unavailable or the statement failed.
    Storage(String),
    /// Persisted data does not parse back into domain types.
    Corruption(String),
}

impl StoreError {
    pub fn storage(op: &str, detail: impl fmt::Display) -> Self {
        StoreError::Storage(format!("{}: {}", op, detail))
    }

    pub fn corruption(detail: impl fmt::Display) -> Self {
        StoreError::Corruption(detail.to_string())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Storage(msg) => write!(f, "storage error: {}", msg),
            StoreError::Corruption(msg) => write!(f, "data corruption: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Handle to the control-plane database.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`;
/// the mutex both provides the required synchronization and serializes
/// writing transactions.
pub struct ControlStore {
    /// Exposed as `pub(crate)` so tests can rewind persisted timestamps when
    /// exercising lease expiry.
    pub(crate) conn: Mutex<Connection>,
}

impl ControlStore {
    /// Open (or create) the database file at the given path and run pending
    /// migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::storage("create state directory", e))?;
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e))?;
        Self::from_connection(conn, true)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::storage("open in-memory database", e))?;
        Self::from_connection(conn, false)
    }

    fn from_connection(conn: Connection, durable: bool) -> Result<Self, StoreError> {
        if durable {
            // WAL can silently fail to enable on some filesystems; verify.
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
                .map_err(|e| StoreError::storage("set journal mode", e))?;
            if !mode.eq_ignore_ascii_case("wal") {
                warn!(journal_mode = %mode, "WAL journal mode not available, continuing");
            }
            conn.pragma_update(None, "synchronous", "FULL")
                .map_err(|e| StoreError::storage("set synchronous", e))?;
        }
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .map_err(|e| StoreError::storage("set busy timeout", e))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| StoreError::storage("read schema version", e))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::Storage(format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| StoreError::storage("update schema version", e))?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                prompt TEXT NOT NULL,
                status TEXT NOT NULL,
                route TEXT,
                slot_id TEXT,
                branch_name TEXT,
                worktree_path TEXT,
                commit_sha TEXT,
                parent_run_id TEXT REFERENCES runs(id),
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at);

            CREATE TABLE IF NOT EXISTS run_context (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE REFERENCES runs(id),
                route TEXT,
                page_title TEXT,
                element_hint TEXT,
                note TEXT,
                metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                status_from TEXT,
                status_to TEXT,
                payload TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);

            CREATE TABLE IF NOT EXISTS validation_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                check_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                artifact_uri TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_validation_checks_run ON validation_checks(run_id);

            CREATE TABLE IF NOT EXISTS run_artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                artifact_type TEXT NOT NULL,
                artifact_uri TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_artifacts_run ON run_artifacts(run_id);

            CREATE TABLE IF NOT EXISTS slot_leases (
                slot_id TEXT PRIMARY KEY,
                run_id TEXT,
                lease_state TEXT NOT NULL CHECK(lease_state IN ('leased', 'released', 'expired')),
                leased_at TEXT,
                expires_at TEXT,
                heartbeat_at TEXT
            );

            CREATE TABLE IF NOT EXISTS slot_worktree_bindings (
                slot_id TEXT PRIMARY KEY,
                run_id TEXT,
                branch_name TEXT,
                worktree_path TEXT,
                binding_state TEXT NOT NULL CHECK(binding_state IN ('active', 'released')),
                last_action TEXT NOT NULL CHECK(last_action IN ('assigned', 'reused', 'cleaned_up')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                released_at TEXT
            );

            CREATE TABLE IF NOT EXISTS preview_db_resets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                slot_id TEXT NOT NULL,
                db_name TEXT NOT NULL,
                strategy TEXT NOT NULL CHECK(strategy IN ('seed', 'snapshot')),
                seed_version TEXT,
                snapshot_version TEXT,
                reset_status TEXT NOT NULL,
                details TEXT,
                reset_started_at TEXT NOT NULL,
                reset_completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_preview_db_resets_run ON preview_db_resets(run_id);

            CREATE TABLE IF NOT EXISTS approvals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                reviewer_id TEXT,
                decision TEXT NOT NULL CHECK(decision IN ('approved', 'rejected')),
                reason TEXT,
                failure_reason_code TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approvals_run ON approvals(run_id);

            CREATE TABLE IF NOT EXISTS releases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                release_id TEXT NOT NULL UNIQUE,
                commit_sha TEXT NOT NULL,
                migration_marker TEXT,
                status TEXT NOT NULL,
                deployed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT,
                action TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                payload TEXT,
                run_id TEXT,
                slot_id TEXT,
                commit_sha TEXT,
                trace_id TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create initial schema (v0 -> v1)", e))?;
        Ok(())
    }

    /// Run a closure inside a single transaction.
    ///
    /// `Ok` commits; `Err` rolls back. Every exit path releases the
    /// connection lock. The error type only needs a `From<StoreError>` so
    /// services can return their own error kinds from the closure.
    pub fn with_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
    {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let inner = conn
            .transaction()
            .map_err(|e| E::from(StoreError::storage("begin transaction", e)))?;
        let tx = Tx { inner };
        let value = f(&tx)?;
        tx.inner
            .commit()
            .map_err(|e| E::from(StoreError::storage("commit transaction", e)))?;
        Ok(value)
    }

    /// Insert a `released` lease row for every configured slot that does not
    /// have one yet. Idempotent; called at startup.
    pub fn ensure_slot_rows(&self, slot_ids: &[String]) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for slot_id in slot_ids {
                tx.ensure_slot_lease_row(slot_id)?;
            }
            Ok(())
        })
    }
}

/// A live transaction. Row operations are implemented in the sibling modules
/// as inherent methods so each table's SQL stays next to its row type.
pub struct Tx<'a> {
    inner: rusqlite::Transaction<'a>,
}

impl<'a> Tx<'a> {
    pub(crate) fn conn(&self) -> &rusqlite::Connection {
        &self.inner
    }
}

/// Format a timestamp the way every table stores it.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back. Corruption, not a panic, on bad data.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corruption(format!("bad timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_ts(&s)).transpose()
}

/// Parse a stored JSON payload column.
pub(crate) fn parse_opt_json(
    raw: Option<String>,
) -> Result<Option<serde_json::Value>, StoreError> {
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| StoreError::corruption(format!("bad JSON payload: {}", e)))
    })
    .transpose()
}
