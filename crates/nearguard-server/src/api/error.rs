//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nearguard_core::NearGuardError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 422 Unprocessable Entity - Well-formed input with invalid values.
    UnprocessableEntity {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - No beacon answered.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Operation not accepted in the current mode.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Mode the tracker was in.
        mode: Option<String>,
    },

    /// 499 Client Closed Request - The user backed out of a selection.
    Cancelled {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details (not exposed to client in production).
        details: Option<String>,
    },

    /// 502 Bad Gateway - The beacon rejected or failed a GATT operation.
    BadGateway {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - The beacon link is down.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "OPERATION_REJECTED",
    "message": "'request_radar' is not available in alert mode",
    "details": { "mode": "alert" }
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "CONNECTION_FAILED").
    #[schema(example = "CONNECTION_FAILED")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Could not connect to the beacon: timed out after 5s")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            Self::BadRequest { error_code, message } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::UnprocessableEntity { error_code, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::NotFound { error_code, message } => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::Conflict {
                error_code,
                message,
                mode,
            } => (
                StatusCode::CONFLICT,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: Some(serde_json::json!({ "mode": mode })),
                },
            ),

            Self::Cancelled { error_code, message } => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                // Log internal errors
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: error_code,
                        message,
                        details: details.map(|d| serde_json::json!(d)),
                    },
                )
            }

            Self::BadGateway { error_code, message } => (
                StatusCode::BAD_GATEWAY,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: None,
                },
            ),

            Self::ServiceUnavailable {
                error_code,
                message,
                details,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(|d| serde_json::json!(d)),
                },
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::UnprocessableEntity { message, .. } => {
                write!(f, "Unprocessable Entity: {message}")
            }
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::Cancelled { message, .. } => write!(f, "Cancelled: {message}"),
            Self::InternalError { message, .. } => {
                write!(f, "Internal Error: {message}")
            }
            Self::BadGateway { message, .. } => write!(f, "Bad Gateway: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from nearguard_core errors, keyed on the core's status classification.
impl From<NearGuardError> for ApiError {
    fn from(err: NearGuardError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        match err.http_status_code() {
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
                mode: match &err {
                    NearGuardError::Rejected { mode, .. } => Some(mode.to_string()),
                    _ => None,
                },
            },
            499 => Self::Cancelled {
                error_code,
                message,
            },
            502 => Self::BadGateway {
                error_code,
                message,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
                details: None,
            },
            422 => Self::UnprocessableEntity {
                error_code,
                message,
            },
            400..=498 => Self::BadRequest {
                error_code,
                message,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

/// Malformed request bodies get the same JSON error shape as everything else.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = rejection.body_text();
        if rejection.status() == StatusCode::UNPROCESSABLE_ENTITY {
            Self::UnprocessableEntity {
                error_code: "INVALID_REQUEST_BODY".to_string(),
                message,
            }
        } else {
            Self::BadRequest {
                error_code: "MALFORMED_REQUEST_BODY".to_string(),
                message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nearguard_core::OperatingMode;

    use super::*;

    fn status_of(err: NearGuardError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::BadRequest {
            error_code: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }

    #[test]
    fn test_status_matches_core_classification() {
        let errors = [
            NearGuardError::UserCancelled,
            NearGuardError::DeviceUnavailable("x".into()),
            NearGuardError::ConnectionFailed("x".into()),
            NearGuardError::WriteFailed("x".into()),
            NearGuardError::ReadFailed("x".into()),
            NearGuardError::Disconnected,
            NearGuardError::Rejected {
                mode: OperatingMode::Idle,
                operation: "send_alert",
            },
            NearGuardError::ControllerStopped,
            NearGuardError::ConfigValidationError("x".into()),
        ];
        for err in errors {
            let expected = err.http_status_code();
            assert_eq!(status_of(err).as_u16(), expected);
        }
    }

    #[test]
    fn test_rejection_carries_mode() {
        let err = ApiError::from(NearGuardError::Rejected {
            mode: OperatingMode::Alert,
            operation: "request_radar",
        });
        match err {
            ApiError::Conflict {
                error_code, mode, ..
            } => {
                assert_eq!(error_code, "OPERATION_REJECTED");
                assert_eq!(mode.as_deref(), Some("alert"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
