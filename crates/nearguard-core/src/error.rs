//! Unified error types for the nearguard core library.
//!
//! This module provides a unified error type [`NearGuardError`] that covers every
//! classified failure the proximity tracker can surface. Raw collaborator errors
//! ([`TransportError`](crate::transport::TransportError)) are classified at the
//! [`DeviceSession`](crate::session::DeviceSession) boundary and never appear here
//! in their raw shape. Configuration has its own [`ConfigError`](crate::config::ConfigError)
//! which converts into this type.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use nearguard_core::error::{NearGuardError, Result};
//!
//! fn require_device(present: bool) -> Result<()> {
//!     if !present {
//!         return Err(NearGuardError::DeviceUnavailable("no beacon answered".into()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::types::OperatingMode;

/// The unified error type for all nearguard operations.
#[derive(Debug, Error)]
pub enum NearGuardError {
    // =========================================================================
    // SESSION ERRORS
    // =========================================================================
    /// The user dismissed the device picker.
    #[error("Device selection was cancelled")]
    UserCancelled,

    /// No compatible device responded to discovery.
    #[error("No compatible beacon responded: {0}. Ensure the beacon is powered and advertising.")]
    DeviceUnavailable(String),

    /// The active connection needed for alert commands could not be established.
    #[error("Could not connect to the beacon: {0}")]
    ConnectionFailed(String),

    /// An alert command could not be written to the beacon.
    #[error("Failed to send alert command: {0}")]
    WriteFailed(String),

    /// A characteristic read from the beacon failed.
    #[error("Failed to read from the beacon: {0}")]
    ReadFailed(String),

    /// The device session was torn down.
    #[error("Beacon disconnected")]
    Disconnected,

    // =========================================================================
    // STATE MACHINE ERRORS
    // =========================================================================
    /// The requested operation is not accepted in the current mode.
    #[error("'{operation}' is not available in {mode} mode")]
    Rejected {
        /// Mode the controller was in when the request arrived.
        mode: OperatingMode,
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The controller task is no longer running.
    #[error("Proximity controller is not running")]
    ControllerStopped,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for nearguard operations.
pub type Result<T> = std::result::Result<T, NearGuardError>;

impl NearGuardError {
    /// Returns `true` if the error should not be shown to the user as a failure.
    ///
    /// Dismissing the device picker is a choice, not a fault.
    #[inline]
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Returns `true` if the controller falls back to radar after this error
    /// instead of resetting to idle.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 409 Conflict - not allowed in the current state
            Self::Rejected { .. } => 409,

            // 404 Not Found
            Self::DeviceUnavailable(_) => 404,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 499 Client Closed Request - the user backed out
            Self::UserCancelled => 499,

            // 500 Internal Server Error
            Self::IoError(_) | Self::ControllerStopped => 500,

            // 502 Bad Gateway - the beacon misbehaved
            Self::WriteFailed(_) | Self::ReadFailed(_) => 502,

            // 503 Service Unavailable - link problems
            Self::ConnectionFailed(_) | Self::Disconnected => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::UserCancelled => "USER_CANCELLED",
            Self::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::WriteFailed(_) => "WRITE_FAILED",
            Self::ReadFailed(_) => "READ_FAILED",
            Self::Disconnected => "DISCONNECTED",
            Self::Rejected { .. } => "OPERATION_REJECTED",
            Self::ControllerStopped => "CONTROLLER_STOPPED",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for NearGuardError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::WriteError { path, source } => Self::IoError(std::io::Error::new(
                source.kind(),
                format!("Failed to write {path}: {source}"),
            )),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
