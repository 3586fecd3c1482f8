// [libs/infra/db/src/lib.rs]
//! libSQL persistence layer: one client, one idempotent schema, one
//! repository per aggregate. Repositories own their SQL; services own the
//! orchestration between them.

pub mod client;
pub mod errors;
pub mod repositories;
pub mod schema;

pub use client::DbClient;
pub use errors::DbError;
