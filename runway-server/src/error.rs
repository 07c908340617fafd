//! Error taxonomy surfaced to API callers.
//!
//! Every failure a caller can see is a kind plus a human-readable reason.
//! Invalid transitions, lease mismatches, and driver failures are ordinary
//! values flowing back through `Result`; nothing in the service recovers
//! silently or panics its way out of a request.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use runway_core::{SlotContractError, TransitionRuleError};

use crate::store::StoreError;

/// Machine-readable error kinds, mirrored in API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    UnsafeDatabaseTarget,
    LeaseMismatch,
    DriverFailed,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::UnsafeDatabaseTarget => "unsafe_database_target",
            ErrorKind::LeaseMismatch => "lease_mismatch",
            ErrorKind::DriverFailed => "driver_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::LeaseMismatch => StatusCode::CONFLICT,
            ErrorKind::Validation | ErrorKind::UnsafeDatabaseTarget => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::DriverFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error with a caller-facing kind and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason)
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, reason)
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, reason)
    }

    pub fn unsafe_database_target(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsafeDatabaseTarget, reason)
    }

    pub fn lease_mismatch(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::LeaseMismatch, reason)
    }

    pub fn driver_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::DriverFailed, reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, reason)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

impl std::error::Error for ApiError {}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<TransitionRuleError> for ApiError {
    fn from(err: TransitionRuleError) -> Self {
        match err {
            TransitionRuleError::MissingFailureReason
            | TransitionRuleError::UnexpectedFailureReason { .. } => {
                ApiError::validation(err.to_string())
            }
            TransitionRuleError::TerminalState { .. }
            | TransitionRuleError::NotAllowed { .. } => ApiError::conflict(err.to_string()),
        }
    }
}

impl From<SlotContractError> for ApiError {
    fn from(err: SlotContractError) -> Self {
        match err {
            SlotContractError::InvalidSlotId { .. }
            | SlotContractError::InvalidRunIdForBranch { .. } => {
                ApiError::validation(err.to_string())
            }
            SlotContractError::MissingDatabaseName
            | SlotContractError::NonPreviewDatabaseTarget { .. }
            | SlotContractError::SlotDatabaseMismatch { .. } => {
                ApiError::unsafe_database_target(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let body = Json(json!({
            "kind": self.kind.as_str(),
            "reason": self.reason,
        }));
        (status, body).into_response()
    }
}
