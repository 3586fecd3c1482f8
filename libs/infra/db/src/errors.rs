// [libs/infra/db/src/errors.rs]
//! Persistence error catalog and the transient-fault classifier feeding the
//! crack-batch retry ladder.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database link failure: {0}")]
    Connection(String),

    #[error("query rejected: {0}")]
    Query(#[from] libsql::Error),

    #[error("row mapping violation: {0}")]
    Mapping(String),

    #[error("transaction failure: {0}")]
    Transaction(String),

    #[error("record not found: {0}")]
    NotFound(&'static str),

    #[error("state conflict: {0}")]
    Conflict(String),
}

impl DbError {
    /// Whether a retry with backoff is worthwhile. Mirrors the fault classes
    /// the crack-batch layer retries: lock contention, exhausted shared
    /// resources, dropped connections, timeouts.
    pub fn is_transient(&self) -> bool {
        let text = match self {
            DbError::Connection(message) => message.clone(),
            DbError::Query(error) => error.to_string(),
            DbError::Transaction(message) => message.clone(),
            _ => return false,
        };
        let lowered = text.to_lowercase();
        [
            "database is locked",
            "database table is locked",
            "busy",
            "deadlock",
            "connection reset",
            "broken pipe",
            "timed out",
            "timeout",
            "too many connections",
            "out of shared memory",
            "no space left on shared memory",
        ]
        .iter()
        .any(|needle| lowered.contains(needle))
    }
}

/// Maps a libsql error into `DbError`, used where `?` cannot because the
/// source is stringly typed.
pub fn mapping_error(context: &str, detail: impl std::fmt::Display) -> DbError {
    DbError::Mapping(format!("{context}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_lock_and_connection_faults_as_transient() {
        assert!(DbError::Transaction("database is locked".into()).is_transient());
        assert!(DbError::Connection("connection reset by peer".into()).is_transient());
        assert!(DbError::Transaction("SQLITE_BUSY".into()).is_transient());
        assert!(DbError::Connection("statement timed out".into()).is_transient());
    }

    #[test]
    fn permanent_faults_are_not_retried() {
        assert!(!DbError::Mapping("bad uuid".into()).is_transient());
        assert!(!DbError::NotFound("job").is_transient());
        assert!(!DbError::Conflict("already assigned".into()).is_transient());
        assert!(!DbError::Transaction("syntax error near SELECT".into()).is_transient());
    }
}
