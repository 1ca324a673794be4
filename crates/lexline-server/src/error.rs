use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lexline_contracts::{ConsultationStatus, ErrorBody, ErrorResponse, QuotaSnapshot};
use lexline_kernel::TransitionError;
use serde_json::{json, Value};
use thiserror::Error;

/// Everything a handler can fail with, mapped onto the wire error
/// envelope `{ "error": { "code", "message", "details?" } }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("invalid or unknown token")]
    InvalidToken,
    #[error("{0}")]
    AccessDenied(String),
    #[error("monthly consultation quota exhausted")]
    QuotaExceeded { quota: QuotaSnapshot },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{message}")]
    StateConflict {
        message: String,
        current_status: ConsultationStatus,
    },
    #[error("internal error")]
    Infrastructure(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::AuthenticationRequired => "authentication_required",
            ApiError::InvalidToken => "invalid_token",
            ApiError::AccessDenied(_) => "access_denied",
            ApiError::QuotaExceeded { .. } => "quota_exceeded",
            ApiError::NotFound(_) => "not_found",
            ApiError::StateConflict { .. } => "state_conflict",
            ApiError::Infrastructure(_) => "infrastructure_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthenticationRequired | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::AccessDenied(_) | ApiError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::StateConflict { .. } => StatusCode::CONFLICT,
            ApiError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::QuotaExceeded { quota } => Some(json!({ "quota": quota })),
            ApiError::StateConflict { current_status, .. } => {
                Some(json!({ "current_status": current_status }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Infrastructure(detail) = &self {
            // The wire message stays generic; the detail goes to the log.
            tracing::error!(%detail, "infrastructure error");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::WrongStatus { actual, .. } => ApiError::StateConflict {
                message: err.to_string(),
                current_status: actual,
            },
            TransitionError::NotActive { actual } => ApiError::StateConflict {
                message: err.to_string(),
                current_status: actual,
            },
            TransitionError::Forbidden(message) => ApiError::AccessDenied(message.to_string()),
            TransitionError::EmptyMessage => ApiError::Validation(err.to_string()),
        }
    }
}

impl From<String> for ApiError {
    fn from(detail: String) -> Self {
        ApiError::Infrastructure(detail)
    }
}
