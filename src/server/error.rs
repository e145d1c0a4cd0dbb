//! Orchestrator errors and their HTTP mapping

use super::repository::RepositoryError;
use super::storage::StorageError;
use crate::upload::types::ApiErrorBody;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Upload session not found")]
    SessionNotFound,

    #[error("Upload session belongs to another user")]
    SessionForbidden,

    #[error("Upload session is no longer accepting completion")]
    SessionInactive,

    #[error("Upload session has expired")]
    SessionExpired,

    #[error("Recording quota of {limit} reached")]
    QuotaExceeded { limit: u64 },

    #[error("Storage rejected the part set: {0}")]
    AssemblyFailed(String),

    #[error("Recording not found")]
    RecordingNotFound,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::SessionNotFound | ServiceError::RecordingNotFound => StatusCode::NOT_FOUND,
            ServiceError::SessionForbidden | ServiceError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            ServiceError::SessionInactive
            | ServiceError::SessionExpired
            | ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::AssemblyFailed(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Storage(_) | ServiceError::Repository(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::SessionNotFound => "SESSION_NOT_FOUND",
            ServiceError::SessionForbidden => "SESSION_FORBIDDEN",
            ServiceError::SessionInactive => "SESSION_INACTIVE",
            ServiceError::SessionExpired => "SESSION_EXPIRED",
            ServiceError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ServiceError::AssemblyFailed(_) => "ASSEMBLY_FAILED",
            ServiceError::RecordingNotFound => "NOT_FOUND",
            ServiceError::InvalidInput(_) => "INVALID_INPUT",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Storage(_) | ServiceError::Repository(_) | ServiceError::Internal(_) => {
                "INTERNAL"
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(ApiErrorBody {
            error: message,
            status: status.as_u16(),
            code: Some(self.code().to_string()),
        });
        (status, body).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::SessionNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::SessionForbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ServiceError::SessionInactive.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServiceError::SessionExpired.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::QuotaExceeded { limit: 25 }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ServiceError::QuotaExceeded { limit: 25 }.code(), "QUOTA_EXCEEDED");
        assert_eq!(
            ServiceError::AssemblyFailed("gap".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
