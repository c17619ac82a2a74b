//! Error types for backend operations

use std::fmt;
use std::time::Duration;

use crate::config::ConfigError;

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors an adapter can report for a probe or a write
#[derive(Debug)]
pub enum BackendError {
    /// Missing or unusable connection attributes
    Config(ConfigError),

    /// Endpoint unreachable, connection dropped or server-side outage
    Connectivity(String),

    /// Credentials or token rejected
    Authentication(String),

    /// Schema provisioning failed
    Schema(String),

    /// Backend accepted the connection but rejected the payload
    Write { status: Option<u16>, message: String },

    /// The operation exceeded its time budget
    Timeout(Duration),

    /// Failure inside the adapter itself (encoding, crashed task)
    Internal(String),
}

/// Outcome category reported to the dispatcher's caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Configuration,
    Connectivity,
    Authentication,
    Validation,
    Schema,
    Write,
    Timeout,
    Internal,
}

impl FailureKind {
    /// Whether retrying the same batch later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Connectivity | FailureKind::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Configuration => "configuration",
            FailureKind::Connectivity => "connectivity",
            FailureKind::Authentication => "authentication",
            FailureKind::Validation => "validation",
            FailureKind::Schema => "schema",
            FailureKind::Write => "write",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

impl BackendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BackendError::Config(_) => FailureKind::Configuration,
            BackendError::Connectivity(_) => FailureKind::Connectivity,
            BackendError::Authentication(_) => FailureKind::Authentication,
            BackendError::Schema(_) => FailureKind::Schema,
            BackendError::Write { .. } => FailureKind::Write,
            BackendError::Timeout(_) => FailureKind::Timeout,
            BackendError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Classify a non-success HTTP response
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 | 403 => BackendError::Authentication(format!("HTTP {status}: {message}")),
            500..=599 => BackendError::Connectivity(format!("HTTP {status}: {message}")),
            _ => BackendError::Write {
                status: Some(status),
                message,
            },
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Config(err) => write!(f, "invalid backend configuration: {}", err),
            BackendError::Connectivity(msg) => write!(f, "backend unreachable: {}", msg),
            BackendError::Authentication(msg) => write!(f, "authentication failed: {}", msg),
            BackendError::Schema(msg) => write!(f, "schema provisioning failed: {}", msg),
            BackendError::Write {
                status: Some(status),
                message,
            } => write!(f, "write rejected (HTTP {}): {}", status, message),
            BackendError::Write {
                status: None,
                message,
            } => write!(f, "write rejected: {}", message),
            BackendError::Timeout(after) => write!(f, "timed out after {:?}", after),
            BackendError::Internal(msg) => write!(f, "internal adapter error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for BackendError {
    fn from(err: ConfigError) -> Self {
        BackendError::Config(err)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BackendError::Connectivity(format!("request timed out: {}", err));
        }
        if let Some(status) = err.status() {
            return BackendError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_builder() {
            return BackendError::Internal(err.to_string());
        }
        BackendError::Connectivity(err.to_string())
    }
}

#[cfg(feature = "timescale")]
impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => BackendError::Connectivity(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // invalid_authorization_specification / invalid_password
                Some("28000") | Some("28P01") => BackendError::Authentication(err.to_string()),
                _ => BackendError::Write {
                    status: None,
                    message: err.to_string(),
                },
            },
            _ => BackendError::Internal(err.to_string()),
        }
    }
}
