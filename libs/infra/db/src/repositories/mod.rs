// [libs/infra/db/src/repositories/mod.rs]
//! Repository access matrix. Each aggregate gets one repository struct over
//! a `DbClient`; cross-aggregate invariants (busy flags, crack counters) are
//! sealed inside transactions here, never at call sites.

pub mod agent;
pub mod benchmark;
pub mod file;
pub mod hash;
pub mod job;
pub mod offline;
pub mod settings;
pub mod task;

pub use agent::AgentRepository;
pub use benchmark::BenchmarkRepository;
pub use file::FileRepository;
pub use hash::HashRepository;
pub use job::JobRepository;
pub use offline::OfflineRepository;
pub use settings::SettingsRepository;
pub use task::TaskRepository;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::errors::{mapping_error, DbError};

/// Parses either RFC 3339 or SQLite's `CURRENT_TIMESTAMP` format.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DbError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|error| mapping_error("timestamp", format!("{raw}: {error}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(raw).map_err(|error| mapping_error("uuid", format!("{raw}: {error}")))
}

pub(crate) fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>, DbError> {
    raw.map(|value| parse_uuid(&value)).transpose()
}

/// Nullable column reads: a NULL surfaces as a get error, so `.ok()` is the
/// NULL-safe projection the driver offers.
pub(crate) fn opt_text(row: &libsql::Row, index: i32) -> Option<String> {
    row.get::<String>(index).ok()
}

pub(crate) fn opt_int(row: &libsql::Row, index: i32) -> Option<i64> {
    row.get::<i64>(index).ok()
}

pub(crate) fn opt_real(row: &libsql::Row, index: i32) -> Option<f64> {
    row.get::<f64>(index).ok()
}

pub(crate) fn as_u64(value: i64) -> u64 {
    value.max(0) as u64
}

pub(crate) fn opt_u64(value: Option<i64>) -> Option<u64> {
    value.map(as_u64)
}
