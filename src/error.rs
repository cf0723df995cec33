//! Error types for toolgate

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for toolgate
pub type Result<T> = std::result::Result<T, Error>;

/// Why a bearer token (or credential) was rejected.
///
/// The kind is part of the public error surface: callers and audit records
/// distinguish an expired token from a revoked one. Messages never echo the
/// token itself.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Token is structurally invalid or its signature does not verify
    #[error("malformed token")]
    Malformed,
    /// Token expiry has passed
    #[error("token expired")]
    Expired,
    /// Token was revoked, or is unknown to this store
    #[error("token revoked")]
    Revoked,
    /// Supplied credential does not match the registered subject
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Subject is not registered (or empty)
    #[error("unknown subject")]
    UnknownSubject,
}

/// toolgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(AuthFailure),

    /// Authorization denied; names the operation the roles lack
    #[error("Authorization denied: roles {roles:?} lack permission for '{operation}'")]
    Authorization {
        /// Operation that was denied
        operation: String,
        /// Roles held by the caller at denial time
        roles: Vec<String>,
    },

    /// Adapter instance not found
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// Adapter configuration rejected at creation time
    #[error("Adapter configuration error: {0}")]
    AdapterConfig(String),

    /// Adapter execution failed; carries the upstream status when one exists
    #[error("Adapter execution failed{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    AdapterExecution {
        /// Upstream status code, when the backend produced one
        status: Option<u16>,
        /// Normalized failure message
        message: String,
    },

    /// Adapter execution exceeded the instance timeout
    #[error("Adapter execution timed out after {0:?}")]
    AdapterTimeout(Duration),

    /// Cache subsystem failure (contained; dispatch degrades to a live call)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Audit sink failure (contained; the fallback ring absorbs the event)
    #[error("Audit write error: {0}")]
    AuditWrite(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an execution error without an upstream status
    pub fn execution(message: impl Into<String>) -> Self {
        Self::AdapterExecution {
            status: None,
            message: message.into(),
        }
    }

    /// The authentication failure kind, if this is an authentication error
    #[must_use]
    pub fn auth_kind(&self) -> Option<AuthFailure> {
        match self {
            Self::Authentication(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Map to an HTTP-style status code for external surfaces
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authentication(_) => 401,
            Self::Authorization { .. } => 403,
            Self::AdapterNotFound(_) => 404,
            Self::AdapterConfig(_) | Self::Json(_) => 400,
            Self::AdapterTimeout(_) => 504,
            Self::AdapterExecution { status, .. } => status.unwrap_or(502),
            _ => 500,
        }
    }

    /// Whether this error may carry backend-internal detail that external
    /// responses should not leak verbatim
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Cache(_) | Self::AuditWrite(_) | Self::Internal(_) | Self::Io(_)
        )
    }
}
