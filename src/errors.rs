//! Application error types and HTTP response conversion.
//!
//! Every client-visible failure maps onto an RFC 7807 problem-details body:
//!
//! ```json
//! {
//!   "type": "https://errors.fanout.dev/resource_not_found",
//!   "title": "Not Found",
//!   "status": 404,
//!   "detail": "Event with ID evt_… not found",
//!   "error_code": "resource_not_found"
//! }
//! ```
//!
//! Handlers return `Result<T, Error>`; the [`IntoResponse`] impl picks the
//! status code, logs at a severity matched to the failure class, and renders
//! the envelope. Idempotency conflicts carry the existing event id as an
//! extension member so callers can recover the original admission.

use axum::{
    http::{StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error as ThisError;

use crate::db::errors::DbError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed request or business rule violation
    #[error("{message}")]
    Validation { message: String },

    /// Missing or invalid API key
    #[error("not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Valid key, insufficient scope
    #[error("missing required scope {required}")]
    Forbidden { required: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Concurrent-modification or duplicate-resource conflict
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Re-admission with an already-used idempotency key
    #[error("idempotency key already used for event {existing_event_id}")]
    IdempotencyConflict { existing_event_id: String },

    /// Payload exceeds the admission limits
    #[error("payload too large: {message}")]
    PayloadTooLarge { message: String },

    /// Token bucket empty for this credential
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// An upstream call exceeded its deadline
    #[error("timed out while {operation}")]
    Timeout { operation: String },

    /// A dependency (fast store, downstream) is unreachable
    #[error("{component} unavailable")]
    Unavailable { component: String },

    /// A fast-store queue operation failed mid-flight
    #[error("queue operation failed: {message}")]
    QueueOperation { message: String },

    #[error(transparent)]
    Database(#[from] DbError),

    /// Generic internal service error
    #[error("failed to {operation}")]
    Internal { operation: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Machine-readable error codes carried in the `error_code` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    InvalidApiKey,
    InsufficientPermissions,
    ResourceNotFound,
    ResourceConflict,
    IdempotencyConflict,
    RateLimitExceeded,
    DatabaseError,
    QueueOperationFailed,
    InternalError,
    ServiceUnavailable,
    TimeoutError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::InvalidApiKey => "invalid_api_key",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::ResourceNotFound => "resource_not_found",
            Self::ResourceConflict => "resource_conflict",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::DatabaseError => "database_error",
            Self::QueueOperationFailed => "queue_operation_failed",
            Self::InternalError => "internal_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::TimeoutError => "timeout_error",
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } | Error::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::QueueOperation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db) => match db {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Validation { .. } | Error::PayloadTooLarge { .. } => ErrorCode::ValidationError,
            Error::Unauthenticated { .. } => ErrorCode::InvalidApiKey,
            Error::Forbidden { .. } => ErrorCode::InsufficientPermissions,
            Error::NotFound { .. } => ErrorCode::ResourceNotFound,
            Error::Conflict { .. } => ErrorCode::ResourceConflict,
            Error::IdempotencyConflict { .. } => ErrorCode::IdempotencyConflict,
            Error::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            Error::Timeout { .. } => ErrorCode::TimeoutError,
            Error::Unavailable { .. } => ErrorCode::ServiceUnavailable,
            Error::QueueOperation { .. } => ErrorCode::QueueOperationFailed,
            Error::Database(db) => match db {
                DbError::NotFound => ErrorCode::ResourceNotFound,
                DbError::UniqueViolation { .. } => ErrorCode::ResourceConflict,
                DbError::ForeignKeyViolation { .. } => ErrorCode::ValidationError,
                DbError::PoolExhausted => ErrorCode::ServiceUnavailable,
                DbError::Other(_) => ErrorCode::DatabaseError,
            },
            Error::Internal { .. } | Error::Other(_) => ErrorCode::InternalError,
        }
    }

    /// A short human-readable title for the problem type.
    fn title(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::FORBIDDEN => "Forbidden",
            StatusCode::NOT_FOUND => "Not Found",
            StatusCode::CONFLICT => "Conflict",
            StatusCode::PAYLOAD_TOO_LARGE => "Payload Too Large",
            StatusCode::TOO_MANY_REQUESTS => "Too Many Requests",
            StatusCode::SERVICE_UNAVAILABLE => "Service Unavailable",
            StatusCode::GATEWAY_TIMEOUT => "Gateway Timeout",
            _ => "Internal Server Error",
        }
    }

    /// User-safe detail message without internal context.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message } => message.clone(),
            Error::Unauthenticated { message } => message
                .clone()
                .unwrap_or_else(|| "Missing or invalid API key".to_string()),
            Error::Forbidden { required } => {
                format!("API key is missing the required scope: {required}")
            }
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::IdempotencyConflict { existing_event_id } => {
                format!("Idempotency key already used for event: {existing_event_id}")
            }
            Error::PayloadTooLarge { message } => message.clone(),
            Error::RateLimited { .. } => "Too many requests. Please slow down.".to_string(),
            Error::Timeout { operation } => format!("Timed out while {operation}"),
            Error::Unavailable { component } => format!("{component} is currently unavailable"),
            Error::QueueOperation { message } => message.clone(),
            Error::Database(db) => match db {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => {
                    "Invalid reference to related resource".to_string()
                }
                DbError::PoolExhausted => "Service temporarily overloaded, please retry".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("internal service error: {:#}", self);
            }
            Error::Database(DbError::PoolExhausted) => {
                tracing::warn!("database connection pool exhausted");
            }
            Error::Database(_) | Error::Conflict { .. } | Error::QueueOperation { .. } => {
                tracing::warn!("request failed: {}", self);
            }
            Error::Unavailable { .. } => {
                tracing::warn!("dependency unavailable: {}", self);
            }
            Error::Unauthenticated { .. } | Error::Forbidden { .. } | Error::RateLimited { .. } => {
                tracing::info!("request rejected: {}", self);
            }
            _ => {
                tracing::debug!("client error: {}", self);
            }
        }

        let status = self.status_code();
        let code = self.error_code();

        let mut body = json!({
            "type": format!("https://errors.fanout.dev/{}", code.as_str()),
            "title": self.title(),
            "status": status.as_u16(),
            "detail": self.user_message(),
            "error_code": code.as_str(),
        });

        if let Error::IdempotencyConflict { existing_event_id } = &self {
            body["existing_event_id"] = json!(existing_event_id);
        }

        match &self {
            Error::RateLimited { retry_after_secs } => (
                status,
                [(RETRY_AFTER, retry_after_secs.to_string())],
                Json(body),
            )
                .into_response(),
            Error::Database(DbError::PoolExhausted) => {
                (status, [(RETRY_AFTER, "30".to_string())], Json(body)).into_response()
            }
            _ => (status, Json(body)).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::Validation {
                message: "bad".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Unauthenticated { message: None }.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::IdempotencyConflict {
                existing_event_id: "evt_x".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::RateLimited {
                retry_after_secs: 5
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Database(DbError::PoolExhausted).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_codes_are_snake_case() {
        assert_eq!(ErrorCode::InvalidApiKey.as_str(), "invalid_api_key");
        assert_eq!(
            Error::Forbidden {
                required: "events:write".into()
            }
            .error_code()
            .as_str(),
            "insufficient_permissions"
        );
    }

    #[test]
    fn test_idempotency_conflict_detail_names_event() {
        let err = Error::IdempotencyConflict {
            existing_event_id: "evt_01ABC".into(),
        };
        assert!(err.user_message().contains("evt_01ABC"));
    }
}
