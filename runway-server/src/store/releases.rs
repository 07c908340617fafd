//! Row operations for `releases`.
//!
//! Releases are keyed by `release_id` (the deployed commit SHA) and upserted
//! by the merge gate: `deployed` on success, `deploy_failed` on a failed
//! reload, `replaced` when a newer release supersedes, `rolled_back` after a
//! rollback restores it.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{format_ts, parse_opt_ts, parse_ts, StoreError, Tx};

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRow {
    pub id: i64,
    pub release_id: String,
    pub commit_sha: String,
    pub migration_marker: Option<String>,
    pub status: String,
    pub deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const RELEASE_COLUMNS: &str =
    "id, release_id, commit_sha, migration_marker, status, deployed_at, created_at, updated_at";

fn row_to_release(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRelease> {
    Ok(RawRelease {
        id: row.get(0)?,
        release_id: row.get(1)?,
        commit_sha: row.get(2)?,
        migration_marker: row.get(3)?,
        status: row.get(4)?,
        deployed_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

struct RawRelease {
    id: i64,
    release_id: String,
    commit_sha: String,
    migration_marker: Option<String>,
    status: String,
    deployed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRelease {
    fn into_release(self) -> Result<ReleaseRow, StoreError> {
        Ok(ReleaseRow {
            id: self.id,
            release_id: self.release_id,
            commit_sha: self.commit_sha,
            migration_marker: self.migration_marker,
            status: self.status,
            deployed_at: parse_opt_ts(self.deployed_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl<'a> Tx<'a> {
    /// Insert or update a release. `deployed_at` is stamped the first time a
    /// release reaches `deployed` or `rolled_back`.
    pub fn upsert_release(
        &self,
        release_id: &str,
        commit_sha: &str,
        status: &str,
        migration_marker: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReleaseRow, StoreError> {
        let ts = format_ts(now);
        let deployed_at = if matches!(status, "deployed" | "rolled_back") {
            Some(ts.clone())
        } else {
            None
        };
        self.conn().execute(
            "INSERT INTO releases \
             (release_id, commit_sha, migration_marker, status, deployed_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT (release_id) DO UPDATE SET \
                commit_sha = excluded.commit_sha, \
                status = excluded.status, \
                migration_marker = COALESCE(excluded.migration_marker, migration_marker), \
                deployed_at = COALESCE(deployed_at, excluded.deployed_at), \
                updated_at = excluded.updated_at",
            params![release_id, commit_sha, migration_marker, status, deployed_at, ts],
        )?;
        self.get_release(release_id)?
            .ok_or_else(|| StoreError::corruption("release vanished after upsert"))
    }

    pub fn get_release(&self, release_id: &str) -> Result<Option<ReleaseRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {RELEASE_COLUMNS} FROM releases WHERE release_id = ?1"),
                params![release_id],
                row_to_release,
            )
            .optional()?;
        raw.map(RawRelease::into_release).transpose()
    }

    pub fn list_releases(
        &self,
        status: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ReleaseRow>, StoreError> {
        let mut releases = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {RELEASE_COLUMNS} FROM releases WHERE status = ?1 \
                     ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![status, limit], row_to_release)?;
                for raw in rows {
                    releases.push(raw?.into_release()?);
                }
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {RELEASE_COLUMNS} FROM releases ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_release)?;
                for raw in rows {
                    releases.push(raw?.into_release()?);
                }
            }
        }
        Ok(releases)
    }

    /// The most recently recorded `deployed` release, if any.
    pub fn latest_deployed_release(&self) -> Result<Option<ReleaseRow>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {RELEASE_COLUMNS} FROM releases WHERE status = 'deployed' \
                     ORDER BY id DESC LIMIT 1"
                ),
                [],
                row_to_release,
            )
            .optional()?;
        raw.map(RawRelease::into_release).transpose()
    }
}
