//! Handlers for the run lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use runway_core::{
    list_failure_reason_codes, list_run_states, FailureReasonCode, RunState,
};

use super::AppState;
use crate::error::ApiError;
use crate::merge_gate::{ApproveRequest, RejectRequest};
use crate::runs::{CreateRunRequest, RunWithContext, TransitionRequest};
use crate::store::RunFilter;

#[derive(Debug, Deserialize)]
pub struct CreateRunBody {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub element_hint: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub to_status: String,
    #[serde(default)]
    pub failure_reason_code: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActorBody {
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reviewer_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub failure_reason_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Comma-separated list of states.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RunContextResponse {
    pub route: Option<String>,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub status: String,
    pub route: Option<String>,
    pub slot_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub commit_sha: Option<String>,
    pub parent_run_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub context: Option<RunContextResponse>,
}

impl From<RunWithContext> for RunResponse {
    fn from(value: RunWithContext) -> Self {
        let RunWithContext { run, context } = value;
        RunResponse {
            id: run.id,
            title: run.title,
            prompt: run.prompt,
            status: run.status.as_str().to_string(),
            route: run.route,
            slot_id: run.slot_id,
            branch_name: run.branch_name,
            worktree_path: run.worktree_path,
            commit_sha: run.commit_sha,
            parent_run_id: run.parent_run_id,
            created_by: run.created_by,
            created_at: run.created_at,
            updated_at: run.updated_at,
            context: context.map(|context| RunContextResponse {
                route: context.route,
                page_title: context.page_title,
                element_hint: context.element_hint,
                note: context.note,
                metadata: context.metadata,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunListResponse {
    pub items: Vec<RunResponse>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

fn parse_state(raw: &str) -> Result<RunState, ApiError> {
    raw.parse::<RunState>()
        .map_err(|e| ApiError::validation(e.to_string()))
}

fn parse_failure_code(raw: Option<&str>) -> Result<Option<FailureReasonCode>, ApiError> {
    raw.map(|code| {
        code.parse::<FailureReasonCode>()
            .map_err(|e| ApiError::validation(e.to_string()))
    })
    .transpose()
}

/// Normalize a route filter to a bare path: strip query/fragment, ensure a
/// leading slash, drop a trailing one.
fn normalize_route_path(route: &str) -> String {
    let value = route.trim();
    if value.is_empty() {
        return "/".to_string();
    }
    let path_only = value
        .split('?')
        .next()
        .unwrap_or("")
        .split('#')
        .next()
        .unwrap_or("");
    let with_prefix = if path_only.starts_with('/') {
        path_only.to_string()
    } else {
        format!("/{path_only}")
    };
    if with_prefix.len() > 1 && with_prefix.ends_with('/') {
        with_prefix[..with_prefix.len() - 1].to_string()
    } else {
        with_prefix
    }
}

pub async fn run_contract() -> Json<Value> {
    Json(json!({
        "states": list_run_states(),
        "failure_reason_codes": list_failure_reason_codes(),
    }))
}

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRunBody>,
) -> Result<Json<RunResponse>, ApiError> {
    let created = state.runs.create(CreateRunRequest {
        title: body.title,
        prompt: body.prompt,
        route: body.route,
        page_title: body.page_title,
        element_hint: body.element_hint,
        note: body.note,
        metadata: body.metadata,
        created_by: body.created_by,
    })?;
    Ok(Json(created.into()))
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<RunListResponse>, ApiError> {
    let statuses = match &query.status {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_state)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0);
    let filter = RunFilter {
        statuses,
        route: query
            .route
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(normalize_route_path),
        limit,
        offset,
    };
    let (items, total) = state.runs.list(&filter)?;
    Ok(Json(RunListResponse {
        items: items.into_iter().map(RunResponse::from).collect(),
        total,
        limit,
        offset,
    }))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    Ok(Json(state.runs.get(&run_id)?.into()))
}

pub async fn transition_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> Result<Json<RunResponse>, ApiError> {
    let request = TransitionRequest {
        to_status: parse_state(&body.to_status)?,
        failure_reason_code: parse_failure_code(body.failure_reason_code.as_deref())?,
        payload: body.payload,
        actor: body.actor,
    };
    state.runs.transition(&run_id, &request)?;
    Ok(Json(state.runs.get(&run_id)?.into()))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<RunResponse>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    state
        .runs
        .cancel(&run_id, body.reason.as_deref(), body.actor.as_deref())
        .await?;
    Ok(Json(state.runs.get(&run_id)?.into()))
}

pub async fn retry_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<ActorBody>>,
) -> Result<Json<RunResponse>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let child = state.runs.retry(&run_id, body.actor.as_deref())?;
    Ok(Json(child.into()))
}

pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<ActorBody>>,
) -> Result<Json<RunResponse>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let child = state.runs.resume(&run_id, body.actor.as_deref())?;
    Ok(Json(child.into()))
}

pub async fn expire_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<ActorBody>>,
) -> Result<Json<RunResponse>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    state.runs.expire(&run_id, body.actor.as_deref())?;
    Ok(Json(state.runs.get(&run_id)?.into()))
}

#[derive(Debug, Serialize)]
pub struct RunEventResponse {
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

pub async fn list_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RunEventResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(200).clamp(1, 500);
    let events = state
        .store
        .with_tx(|tx| Ok::<_, ApiError>(tx.list_run_events(&run_id, limit)?))?;
    Ok(Json(
        events
            .into_iter()
            .map(|event| RunEventResponse {
                id: event.id,
                run_id: event.run_id,
                event_type: event.event_type,
                status_from: event.status_from,
                status_to: event.status_to,
                payload: event.payload,
                created_at: event.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct ValidationCheckResponse {
    pub id: i64,
    pub run_id: String,
    pub check_name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
}

pub async fn list_run_checks(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ValidationCheckResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 300);
    let checks = state
        .store
        .with_tx(|tx| Ok::<_, ApiError>(tx.list_validation_checks(&run_id, limit)?))?;
    Ok(Json(
        checks
            .into_iter()
            .map(|check| ValidationCheckResponse {
                id: check.id,
                run_id: check.run_id,
                check_name: check.check_name,
                status: check.status,
                started_at: check.started_at,
                ended_at: check.ended_at,
                artifact_uri: check.artifact_uri,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct RunArtifactResponse {
    pub id: i64,
    pub run_id: String,
    pub artifact_type: String,
    pub artifact_uri: String,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

pub async fn list_run_artifacts(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RunArtifactResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(200).clamp(1, 500);
    let artifacts = state
        .store
        .with_tx(|tx| Ok::<_, ApiError>(tx.list_run_artifacts(&run_id, limit)?))?;
    Ok(Json(
        artifacts
            .into_iter()
            .map(|artifact| RunArtifactResponse {
                id: artifact.id,
                run_id: artifact.run_id,
                artifact_type: artifact.artifact_type,
                artifact_uri: artifact.artifact_uri,
                payload: artifact.payload,
                created_at: artifact.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub id: i64,
    pub run_id: String,
    pub reviewer_id: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
    pub failure_reason_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<crate::store::ApprovalRow> for ApprovalResponse {
    fn from(row: crate::store::ApprovalRow) -> Self {
        ApprovalResponse {
            id: row.id,
            run_id: row.run_id,
            reviewer_id: row.reviewer_id,
            decision: row.decision,
            reason: row.reason,
            failure_reason_code: row.failure_reason_code,
            created_at: row.created_at,
        }
    }
}

pub async fn list_run_approvals(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<ApprovalResponse>>, ApiError> {
    let approvals = state
        .store
        .with_tx(|tx| Ok::<_, ApiError>(tx.list_approvals(&run_id)?))?;
    Ok(Json(
        approvals.into_iter().map(ApprovalResponse::from).collect(),
    ))
}

pub async fn approve_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let approval = state
        .merge_gate
        .approve(
            &run_id,
            &ApproveRequest {
                reviewer_id: body.reviewer_id,
                reason: body.reason,
            },
        )
        .await?;
    Ok(Json(approval.into()))
}

pub async fn reject_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let failure_reason_code = parse_failure_code(body.failure_reason_code.as_deref())?
        .unwrap_or(FailureReasonCode::PolicyRejected);
    let approval = state
        .merge_gate
        .reject(
            &run_id,
            &RejectRequest {
                reviewer_id: body.reviewer_id,
                reason: body.reason,
                failure_reason_code,
            },
        )
        .await?;
    Ok(Json(approval.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_route_path() {
        assert_eq!(normalize_route_path("/codex"), "/codex");
        assert_eq!(normalize_route_path("codex"), "/codex");
        assert_eq!(normalize_route_path("/codex/"), "/codex");
        assert_eq!(normalize_route_path("/codex?tab=1"), "/codex");
        assert_eq!(normalize_route_path("/codex#anchor"), "/codex");
        assert_eq!(normalize_route_path(""), "/");
        assert_eq!(normalize_route_path("/"), "/");
    }

    #[test]
    fn test_parse_state_rejects_unknown() {
        assert!(parse_state("queued").is_ok());
        assert!(parse_state("nonsense").is_err());
    }

    #[test]
    fn test_parse_failure_code() {
        assert_eq!(
            parse_failure_code(Some("POLICY_REJECTED")).unwrap(),
            Some(FailureReasonCode::PolicyRejected)
        );
        assert_eq!(parse_failure_code(None).unwrap(), None);
        assert!(parse_failure_code(Some("NOPE")).is_err());
    }
}
