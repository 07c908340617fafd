//! Handlers for the release registry endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiError;
use crate::store::ReleaseRow;

#[derive(Debug, Deserialize)]
pub struct ListReleasesQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub id: i64,
    pub release_id: String,
    pub commit_sha: String,
    pub migration_marker: Option<String>,
    pub status: String,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl From<ReleaseRow> for ReleaseResponse {
    fn from(row: ReleaseRow) -> Self {
        ReleaseResponse {
            id: row.id,
            release_id: row.release_id,
            commit_sha: row.commit_sha,
            migration_marker: row.migration_marker,
            status: row.status,
            deployed_at: row.deployed_at,
        }
    }
}

pub async fn get_releases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListReleasesQuery>,
) -> Result<Json<Vec<ReleaseResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let releases = state
        .merge_gate
        .list_releases(query.status.as_deref(), limit)?;
    Ok(Json(
        releases.into_iter().map(ReleaseResponse::from).collect(),
    ))
}

pub async fn get_release(
    State(state): State<Arc<AppState>>,
    Path(release_id): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    Ok(Json(state.merge_gate.get_release(&release_id)?.into()))
}
