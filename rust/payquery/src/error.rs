use crate::{
    conversation::TargetCandidate, pagination::PaginationErrorCode, safety::SafetyRejection,
    validator::ValidationErrors,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("sql rejected: {0}")]
    Rejected(SafetyRejection),

    #[error("{}", .0.message())]
    Pagination(PaginationErrorCode),

    #[error("{message}")]
    Ambiguous {
        message: String,
        candidates: Vec<TargetCandidate>,
    },

    #[error("target turn not found: {0}")]
    TargetNotFound(String),

    #[error("query exceeded timeout of {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("query execution failed: {0}")]
    Execution(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "CONFIG_ERROR",
            ServiceError::Auth => "UNAUTHORIZED",
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::Validation(errors) => errors.primary().code.as_str(),
            ServiceError::Rejected(rejection) => rejection.code.as_str(),
            ServiceError::Pagination(code) => code.as_str(),
            ServiceError::Ambiguous { .. } => "NEEDS_DISAMBIGUATION",
            ServiceError::TargetNotFound(_) => "TARGET_NOT_FOUND",
            ServiceError::Timeout(_) => "QUERY_TIMEOUT",
            ServiceError::Execution(_) => "EXECUTION_FAILED",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Config(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) | ServiceError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Pagination(PaginationErrorCode::InvalidToken) => StatusCode::NOT_FOUND,
            ServiceError::Pagination(PaginationErrorCode::PageOutOfRange) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Ambiguous { .. } => StatusCode::CONFLICT,
            ServiceError::TargetNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Execution(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::Validation(errors) => serde_json::to_value(errors.as_slice()).ok(),
            ServiceError::Ambiguous { candidates, .. } => serde_json::to_value(candidates).ok(),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(
            self,
            ServiceError::Config(_)
                | ServiceError::Internal(_)
                | ServiceError::Execution(_)
                | ServiceError::Timeout(_)
        ) {
            error!(error = %self, code = self.code(), "request failed");
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}
