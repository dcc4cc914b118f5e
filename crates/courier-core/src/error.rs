//! Unified error types for the Courier binaries and libraries.

use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for Courier.
///
/// Job-level failures are handled inside the job subsystem and never reach
/// this type; it carries the startup, configuration and composition errors
/// that are allowed to abort the process.
#[derive(Error, Debug)]
pub enum CourierError {
    // ============ Lookup Errors ============
    /// A named job or task is not registered.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A workable type violates its registration contract.
    #[error("Invalid workable: {0}")]
    InvalidWorkable(String),

    /// Invalid argument supplied on the command line.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ============ Infrastructure Errors ============
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Queue backend could not be reached.
    #[error("Queue backend unavailable: {driver} - {message}")]
    Backend { driver: String, message: String },

    /// Logging could not be initialised.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CourierError {
    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 2,
            _ => 1,
        }
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidWorkable(_) => "INVALID_WORKABLE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Backend { .. } => "BACKEND_UNAVAILABLE",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a not found error for a job or task name.
    #[must_use]
    pub fn not_found<T: ToString>(kind: &'static str, name: T) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if retrying the failed startup step could succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}
