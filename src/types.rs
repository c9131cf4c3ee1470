//! Shared error and result types
//!
//! Every error surfaced to the wire carries a short machine-readable code
//! plus a human message. Stack traces and script sources never leave the
//! process; full detail goes to the activity log instead.

use hyper::StatusCode;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FaztError>;

/// Top-level error taxonomy
///
/// Variants map one-to-one onto the wire statuses in the error table:
/// retriable storage pressure surfaces as 503, validation as 400, script
/// faults as 500/504, and startup faults (migrations, certificates without
/// a cached fallback) abort the process before serving begins.
#[derive(Debug, Error)]
pub enum FaztError {
    /// Write queue retries exhausted on a busy database
    #[error("storage busy: {0}")]
    StorageBusy(String),

    /// Entity lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Request shape or argument type rejected at the API boundary
    #[error("validation: {0}")]
    Validation(String),

    /// Protected route reached without a session
    #[error("authentication required")]
    AuthRequired,

    /// Session present but role check failed
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Edge or login token bucket exhausted
    #[error("rate limited")]
    RateLimited,

    /// Script raised an error; message is already sanitized
    #[error("script error: {0}")]
    Script(String),

    /// Script exceeded its CPU-time deadline
    #[error("script timeout after {0}ms")]
    ScriptTimeout(u64),

    /// Job exceeded its declared memory budget
    #[error("job memory budget exceeded: {0}")]
    JobOom(String),

    /// ACME provisioning failed and no cached certificate exists
    #[error("certificate provisioning failed: {0}")]
    CertProvision(String),

    /// Schema migration failed; always fatal at startup
    #[error("migration failed: {0}")]
    Migration(String),

    /// Database-level fault that is not a transient busy condition
    #[error("database: {0}")]
    Database(String),

    /// Anything else; never carries internal detail to the wire
    #[error("internal: {0}")]
    Internal(String),
}

impl FaztError {
    /// Short machine-readable code for the JSON error envelope
    pub fn code(&self) -> &'static str {
        match self {
            FaztError::StorageBusy(_) => "storage_busy",
            FaztError::NotFound(_) => "not_found",
            FaztError::Validation(_) => "validation",
            FaztError::AuthRequired => "auth_required",
            FaztError::Forbidden(_) => "forbidden",
            FaztError::RateLimited => "rate_limited",
            FaztError::Script(_) => "script_error",
            FaztError::ScriptTimeout(_) => "script_timeout",
            FaztError::JobOom(_) => "job_oom",
            FaztError::CertProvision(_) => "cert_provision",
            FaztError::Migration(_) => "migration",
            FaztError::Database(_) => "database",
            FaztError::Internal(_) => "internal",
        }
    }

    /// HTTP status the error surfaces as at the edge
    pub fn status(&self) -> StatusCode {
        match self {
            FaztError::StorageBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            FaztError::NotFound(_) => StatusCode::NOT_FOUND,
            FaztError::Validation(_) => StatusCode::BAD_REQUEST,
            FaztError::AuthRequired => StatusCode::UNAUTHORIZED,
            FaztError::Forbidden(_) => StatusCode::FORBIDDEN,
            FaztError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            FaztError::Script(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FaztError::ScriptTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FaztError::JobOom(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FaztError::CertProvision(_) | FaztError::Migration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            FaztError::Database(_) | FaztError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the caller may retry the same operation
    pub fn is_retriable(&self) -> bool {
        matches!(self, FaztError::StorageBusy(_) | FaztError::RateLimited)
    }
}

impl From<rusqlite::Error> for FaztError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => FaztError::NotFound("no rows".into()),
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                FaztError::StorageBusy(e.to_string())
            }
            _ => FaztError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for FaztError {
    fn from(e: serde_json::Error) -> Self {
        FaztError::Validation(format!("invalid JSON: {e}"))
    }
}

impl From<std::io::Error> for FaztError {
    fn from(e: std::io::Error) -> Self {
        FaztError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_503() {
        let err = FaztError::StorageBusy("retries exhausted".into());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "storage_busy");
        assert!(err.is_retriable());
    }

    #[test]
    fn timeout_maps_to_504() {
        let err = FaztError::ScriptTimeout(5000);
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!err.is_retriable());
    }

    #[test]
    fn no_rows_becomes_not_found() {
        let err: FaztError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, FaztError::NotFound(_)));
    }
}
