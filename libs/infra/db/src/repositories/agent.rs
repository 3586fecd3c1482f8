// [libs/infra/db/src/repositories/agent.rs]
//! Agent records. The busy flag is never mutated on its own: every toggle
//! rides in the same transaction as the task transition that justifies it
//! (see `task::TaskRepository`), keeping `busy ⇔ one live task` true.

use libsql::{params, Connection, Row};
use tracing::instrument;

use krakenhashes_models::{Agent, AgentStatus, Device, SyncStatus};

use crate::client::DbClient;
use crate::errors::{mapping_error, DbError};

use super::{opt_text, parse_optional_uuid, parse_timestamp};

pub struct AgentRepository {
    database_client: DbClient,
}

impl AgentRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    /// Registers an agent or returns the existing id for its API key.
    #[instrument(skip(self, api_key))]
    pub async fn register(&self, name: &str, api_key: &str) -> Result<i64, DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "INSERT INTO agents (name, api_key) VALUES (?1, ?2)
                 ON CONFLICT (api_key) DO UPDATE SET name = excluded.name",
                params![name, api_key],
            )
            .await?;

        let mut rows = connection
            .query("SELECT id FROM agents WHERE api_key = ?1", params![api_key])
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("agent"))?;
        row.get::<i64>(0).map_err(DbError::Query)
    }

    pub async fn authenticate(&self, agent_id: i64, api_key: &str) -> Result<Agent, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                &format!("{SELECT_AGENT} WHERE id = ?1 AND api_key = ?2"),
                params![agent_id, api_key],
            )
            .await?;
        match rows.next().await? {
            Some(row) => self.hydrate(&connection, row).await,
            None => Err(DbError::NotFound("agent")),
        }
    }

    pub async fn get(&self, agent_id: i64) -> Result<Agent, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(&format!("{SELECT_AGENT} WHERE id = ?1"), params![agent_id])
            .await?;
        match rows.next().await? {
            Some(row) => self.hydrate(&connection, row).await,
            None => Err(DbError::NotFound("agent")),
        }
    }

    /// Agents eligible for scheduling: online, enabled, synced, not busy.
    pub async fn available(&self) -> Result<Vec<Agent>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                &format!(
                    "{SELECT_AGENT}
                     WHERE status = 'online' AND enabled = 1
                       AND busy = 0 AND sync_status = 'completed'
                     ORDER BY id"
                ),
                (),
            )
            .await?;
        let mut agents = Vec::new();
        while let Some(row) = rows.next().await? {
            agents.push(self.hydrate(&connection, row).await?);
        }
        Ok(agents)
    }

    pub async fn set_status(&self, agent_id: i64, status: AgentStatus) -> Result<(), DbError> {
        let status_text = match status {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        };
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE agents
                 SET status = ?1, last_seen_at = CURRENT_TIMESTAMP,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?2",
                params![status_text, agent_id],
            )
            .await?;
        Ok(())
    }

    pub async fn touch_last_seen(&self, agent_id: i64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE agents SET last_seen_at = CURRENT_TIMESTAMP WHERE id = ?1",
                params![agent_id],
            )
            .await?;
        Ok(())
    }

    pub async fn set_sync_status(&self, agent_id: i64, status: SyncStatus) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE agents SET sync_status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![status.as_str(), agent_id],
            )
            .await?;
        Ok(())
    }

    /// Replaces the device inventory with what the agent just reported,
    /// preserving any operator enable/disable choices by device id.
    #[instrument(skip(self, devices), fields(agent = agent_id, count = devices.len()))]
    pub async fn update_devices(&self, agent_id: i64, devices: &[Device]) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        for device in devices {
            transaction
                .execute(
                    "INSERT INTO agent_devices (agent_id, device_id, enabled, device_type, name)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (agent_id, device_id) DO UPDATE
                     SET device_type = excluded.device_type, name = excluded.name",
                    params![
                        agent_id,
                        device.device_id as i64,
                        device.enabled as i64,
                        device.device_type.as_str(),
                        device.name.as_str()
                    ],
                )
                .await?;
        }

        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(())
    }

    pub async fn set_device_enabled(
        &self,
        agent_id: i64,
        device_id: u32,
        enabled: bool,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(
                "UPDATE agent_devices SET enabled = ?1 WHERE agent_id = ?2 AND device_id = ?3",
                params![enabled as i64, agent_id, device_id as i64],
            )
            .await?;
        if affected == 0 {
            return Err(DbError::NotFound("device"));
        }
        Ok(())
    }

    pub async fn update_metadata(
        &self,
        agent_id: i64,
        metadata: &serde_json::Value,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE agents SET metadata = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![metadata.to_string(), agent_id],
            )
            .await?;
        Ok(())
    }

    async fn hydrate(&self, connection: &Connection, row: Row) -> Result<Agent, DbError> {
        let agent_id = row.get::<i64>(0)?;
        let mut agent = map_agent_row(row)?;

        let mut device_rows = connection
            .query(
                "SELECT device_id, enabled, device_type, name
                 FROM agent_devices WHERE agent_id = ?1 ORDER BY device_id",
                params![agent_id],
            )
            .await?;
        while let Some(device_row) = device_rows.next().await? {
            agent.devices.push(Device {
                device_id: device_row.get::<i64>(0)? as u32,
                enabled: device_row.get::<i64>(1)? != 0,
                device_type: device_row.get::<String>(2)?,
                name: device_row.get::<String>(3)?,
            });
        }
        Ok(agent)
    }
}

const SELECT_AGENT: &str = "SELECT id, binary_pattern, enabled, busy, current_task_id,
    current_job_id, extra_parameters, sync_status, status, last_seen_at, metadata
    FROM agents";

fn map_agent_row(row: Row) -> Result<Agent, DbError> {
    let sync_raw = row.get::<String>(7)?;
    let status_raw = row.get::<String>(8)?;
    let metadata_raw = row.get::<String>(10)?;

    Ok(Agent {
        id: row.get::<i64>(0)?,
        binary_pattern: row.get::<String>(1)?,
        enabled: row.get::<i64>(2)? != 0,
        busy: row.get::<i64>(3)? != 0,
        current_task_id: parse_optional_uuid(opt_text(&row, 4))?,
        current_job_id: parse_optional_uuid(opt_text(&row, 5))?,
        extra_parameters: row.get::<String>(6)?,
        devices: Vec::new(),
        sync_status: SyncStatus::parse(&sync_raw)
            .ok_or_else(|| mapping_error("sync_status", &sync_raw))?,
        status: if status_raw == "online" { AgentStatus::Online } else { AgentStatus::Offline },
        last_seen_at: opt_text(&row, 9)
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
        metadata: serde_json::from_str(&metadata_raw)
            .map_err(|error| mapping_error("agent metadata", error))?,
    })
}
