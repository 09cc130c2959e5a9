use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    state::lifecycle::{ApplyError, PlanError},
};

/// Failures of match operations, independent of the transport.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The store backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The match is finished and refuses further writes.
    #[error("match closed: {0}")]
    MatchClosed(String),
    /// The request is malformed or names unknown players.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The match is not in a status that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// No match with that id.
    #[error("not found: {0}")]
    NotFound(String),
    /// A lifecycle transition did not complete in time and was rolled back.
    #[error("transition timed out")]
    Timeout,
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::AlreadyPending => {
                Self::InvalidState("another transition of this match is in flight".into())
            }
            PlanError::InvalidTransition(invalid) => Self::InvalidState(invalid.to_string()),
        }
    }
}

impl From<ApplyError> for ServiceError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::NoPending | ApplyError::IdMismatch { .. } => {
                Self::InvalidState("transition was superseded".into())
            }
            ApplyError::VersionMismatch { expected, actual } => Self::InvalidState(format!(
                "match changed during transition (version {expected} became {actual})"
            )),
        }
    }
}

/// Error answered over HTTP as `{ "code", "message" }`.
///
/// Live clients key their retry policy on the status: 403 means the write will never be
/// accepted, 503 means try again later.
#[derive(Debug, Error)]
pub enum AppError {
    /// 400, `invalid_input`.
    #[error("{0}")]
    BadRequest(String),
    /// 403, `match_closed`.
    #[error("{0}")]
    Forbidden(String),
    /// 404, `not_found`.
    #[error("{0}")]
    NotFound(String),
    /// 409, `invalid_state`.
    #[error("{0}")]
    Conflict(String),
    /// 503, `unavailable`.
    #[error("{0}")]
    Unavailable(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_input",
            Self::Forbidden(_) => "match_closed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "invalid_state",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Storage(source) => Self::Unavailable(source.to_string()),
            ServiceError::Timeout => Self::Unavailable("transition timed out".into()),
            ServiceError::MatchClosed(message) => Self::Forbidden(message),
            ServiceError::InvalidInput(message) => Self::BadRequest(message),
            ServiceError::InvalidState(message) => Self::Conflict(message),
            ServiceError::NotFound(message) => Self::NotFound(message),
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        Self::BadRequest(format!("validation failed: {err}"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
