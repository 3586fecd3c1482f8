// [libs/infra/db/src/client.rs]
//! Database connection handle. Local file, `:memory:` and remote URLs all go
//! through the same builder; the schema is applied idempotently on connect.

use std::sync::Arc;

use libsql::{Builder, Connection, Database};
use tracing::{error, info};

use crate::errors::DbError;
use crate::schema::apply_schema;

#[derive(Clone)]
pub struct DbClient {
    driver: Arc<Database>,
    /// Keeps an in-memory database alive; SQLite drops the store with its
    /// last open connection.
    _memory_anchor: Option<Arc<Connection>>,
}

impl DbClient {
    pub async fn connect(url: &str, auth_token: Option<String>) -> Result<Self, DbError> {
        if url.is_empty() {
            return Err(DbError::Connection("DATABASE_URL is empty".into()));
        }

        info!("[DATABASE]: connecting to {url}");

        let is_remote = url.starts_with("libsql://") || url.starts_with("https://");
        let is_memory = url.contains(":memory:") || url.contains("mode=memory");

        let database = if is_remote {
            let token = auth_token
                .ok_or_else(|| DbError::Connection("remote database requires an auth token".into()))?;
            Builder::new_remote(url.to_string(), token).build().await
        } else {
            Builder::new_local(url).build().await
        }
        .map_err(|error| DbError::Connection(error.to_string()))?;

        let driver = Arc::new(database);
        let mut memory_anchor = None;

        if is_memory {
            let anchor = driver
                .connect()
                .map_err(|error| DbError::Connection(error.to_string()))?;
            apply_schema(&anchor).await?;
            memory_anchor = Some(Arc::new(anchor));
        } else {
            let bootstrap = driver
                .connect()
                .map_err(|error| DbError::Connection(error.to_string()))?;
            apply_schema(&bootstrap).await?;
        }

        Ok(Self { driver, _memory_anchor: memory_anchor })
    }

    pub fn connection(&self) -> Result<Connection, DbError> {
        self.driver.connect().map_err(|error| {
            error!("[DATABASE]: connection allocation failed: {error}");
            DbError::Connection(error.to_string())
        })
    }
}
