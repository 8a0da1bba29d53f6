//! Error types for linking runs.
//!
//! Errors are classified by recoverability:
//! - Retryable: store timeouts, busy database, commit conflicts
//! - NonRetryable: bad configuration, malformed records
//! - Abort: the store is unreachable at batch start
//!
//! Non-fatal outcomes (ambiguous links, skipped overrides, degraded signals)
//! are not errors; they are reported as [`crate::engine::LinkIssue`] values.

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;

/// Failure at the message store seam.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message store unreachable: {0}")]
    Unreachable(String),

    #[error("Store query timed out: {0}")]
    Timeout(String),

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Returns true if repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Unreachable(_))
    }

    /// Returns true if the store cannot be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(ref code, _))
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Timeout(err.to_string())
            }
            DbError::Sqlite(rusqlite::Error::SqliteFailure(ref code, _))
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::CannotOpen
                        | rusqlite::ErrorCode::NotADatabase
                        | rusqlite::ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Unreachable(err.to_string())
            }
            DbError::Serde(e) => StoreError::Invalid(e.to_string()),
            DbError::MessageNotFound(id) => StoreError::NotFound(format!("message {id}")),
            DbError::InvalidWrite(msg) => StoreError::Invalid(msg),
            DbError::HomeDirNotFound | DbError::CreateDir(_) | DbError::Migration(_) => {
                StoreError::Unreachable(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Run-level failures of the linking engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Message store unreachable at batch start: {0}")]
    StoreUnreachable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Returns true if the whole run may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::StoreUnreachable(_) | EngineError::Worker(_) => true,
            EngineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get a recovery suggestion for operators.
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EngineError::StoreUnreachable(_) => {
                "Check the message store; committed decisions are intact and the next run resumes."
            }
            EngineError::Store(_) => "Inspect the store logs and re-run the batch.",
            EngineError::Configuration(_) => "Check ~/.threadlink/config.json.",
            EngineError::ConfigNotFound(_) => {
                "Create ~/.threadlink/config.json or run with the built-in defaults."
            }
            EngineError::Validation(_) => "Fix the request and try again.",
            EngineError::Worker(_) => "A partition worker panicked; re-run the batch.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Timeout("slow".into()).is_retryable());
        assert!(StoreError::Unreachable("down".into()).is_unreachable());
        assert!(!StoreError::Query("bad sql".into()).is_retryable());
        assert!(!StoreError::NotFound("m1".into()).is_unreachable());
    }

    #[test]
    fn test_engine_error_retryable() {
        assert!(EngineError::StoreUnreachable("down".into()).is_retryable());
        assert!(EngineError::Store(StoreError::Timeout("t".into())).is_retryable());
        assert!(!EngineError::Configuration("bad".into()).is_retryable());
        assert!(!EngineError::Validation("empty actor".into()).is_retryable());
    }

    #[test]
    fn test_recovery_suggestions() {
        let down = EngineError::StoreUnreachable("connection refused".into());
        assert!(down.recovery_suggestion().contains("committed decisions are intact"));
        assert!(EngineError::Configuration("bad".into())
            .recovery_suggestion()
            .contains("config.json"));
        assert!(EngineError::ConfigNotFound(PathBuf::from("/nowhere/config.json"))
            .recovery_suggestion()
            .contains("defaults"));
    }

    #[test]
    fn test_db_error_maps_to_invalid() {
        let serde_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let store_err: StoreError = DbError::Serde(serde_err).into();
        assert!(matches!(store_err, StoreError::Invalid(_)));
    }
}
