// [libs/infra/db/src/repositories/offline.rs]
//! Agent-offline notification buffer: one row per disconnected agent, a
//! 60-second sweeper turns due rows into notifications, reconnects cancel.

use chrono::{DateTime, Duration, Utc};
use libsql::params;
use tracing::instrument;

use crate::client::DbClient;
use crate::errors::DbError;

/// Rows older than this are pruned by the sweeper.
pub const RETENTION_DAYS: i64 = 7;

pub struct OfflineRepository {
    database_client: DbClient,
}

impl OfflineRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    /// Upserts the disconnect marker, restarting the grace window.
    #[instrument(skip(self), fields(agent = agent_id))]
    pub async fn record_disconnect(
        &self,
        agent_id: i64,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "INSERT INTO agent_offline_buffer
                 (agent_id, disconnected_at, notification_due_at, sent, reconnected)
                 VALUES (?1, ?2, ?3, 0, 0)
                 ON CONFLICT (agent_id) DO UPDATE
                 SET disconnected_at = excluded.disconnected_at,
                     notification_due_at = excluded.notification_due_at,
                     sent = 0, reconnected = 0",
                params![
                    agent_id,
                    now.to_rfc3339(),
                    (now + grace).to_rfc3339()
                ],
            )
            .await?;
        Ok(())
    }

    /// Cancels the pending notification if the agent came back in time.
    pub async fn record_reconnect(&self, agent_id: i64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE agent_offline_buffer SET reconnected = 1
                 WHERE agent_id = ?1 AND sent = 0",
                params![agent_id],
            )
            .await?;
        Ok(())
    }

    /// Agents whose grace expired without a reconnect and without a
    /// notification yet.
    pub async fn due_notifications(&self, now: DateTime<Utc>) -> Result<Vec<i64>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                "SELECT agent_id FROM agent_offline_buffer
                 WHERE notification_due_at <= ?1 AND sent = 0 AND reconnected = 0",
                params![now.to_rfc3339()],
            )
            .await?;
        let mut due = Vec::new();
        while let Some(row) = rows.next().await? {
            due.push(row.get::<i64>(0)?);
        }
        Ok(due)
    }

    /// Marks a notification dispatched; rows_affected 0 means another
    /// sweeper pass won the race.
    pub async fn mark_sent(&self, agent_id: i64) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(
                "UPDATE agent_offline_buffer SET sent = 1
                 WHERE agent_id = ?1 AND sent = 0",
                params![agent_id],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let connection = self.database_client.connection()?;
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let affected = connection
            .execute(
                "DELETE FROM agent_offline_buffer WHERE disconnected_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await?;
        Ok(affected)
    }
}
