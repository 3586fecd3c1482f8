// [libs/infra/db/src/repositories/task/mod.rs]
//! Task lifecycle persistence. Any transition that also changes an agent's
//! busy flag runs both statements in one transaction; the flag is meaningless
//! unless it moves with the task row.

pub mod queries;

use libsql::{params, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use krakenhashes_models::{JobTask, TaskStatus};

use crate::client::DbClient;
use crate::errors::{mapping_error, DbError};

use super::{as_u64, opt_int, opt_text, opt_u64, parse_optional_uuid, parse_timestamp, parse_uuid};

pub struct TaskRepository {
    database_client: DbClient,
}

impl TaskRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    pub async fn create(&self, task: &JobTask) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::INSERT_TASK,
                params![
                    task.id.to_string(),
                    task.job_id.to_string(),
                    task.layer_id.map(|id| id.to_string()),
                    task.agent_id,
                    task.status.as_str(),
                    task.keyspace_start as i64,
                    task.keyspace_end as i64,
                    task.effective_keyspace_start.map(|value| value as i64),
                    task.effective_keyspace_end.map(|value| value as i64),
                    task.is_keyspace_split as i64,
                    task.is_rule_split as i64,
                    task.rule_chunk_path.clone(),
                    task.rule_start_index.map(|value| value as i64),
                    task.rule_end_index.map(|value| value as i64)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: Uuid) -> Result<JobTask, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                &format!("{} WHERE id = ?1", queries::SELECT_TASK),
                params![task_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => map_task_row(row),
            None => Err(DbError::NotFound("task")),
        }
    }

    pub async fn try_get(&self, task_id: Uuid) -> Result<Option<JobTask>, DbError> {
        match self.get(task_id).await {
            Ok(task) => Ok(Some(task)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    pub async fn tasks_for_job(&self, job_id: Uuid) -> Result<Vec<JobTask>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_FOR_JOB, params![job_id.to_string()])
            .await?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            tasks.push(map_task_row(row)?);
        }
        Ok(tasks)
    }

    pub async fn live_tasks_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<(Uuid, Option<i64>)>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_LIVE_FOR_JOB, params![job_id.to_string()])
            .await?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            tasks.push((
                parse_uuid(&row.get::<String>(0)?)?,
                opt_int(&row, 1),
            ));
        }
        Ok(tasks)
    }

    pub async fn count_for_job(&self, job_id: Uuid) -> Result<u64, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::COUNT_FOR_JOB, params![job_id.to_string()])
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("job"))?;
        Ok(as_u64(row.get::<i64>(0)?))
    }

    /// Moves a pending task to `assigned` and occupies the agent in one
    /// transaction. The status flips before the assignment envelope is sent;
    /// a failed send calls `revert_assignment`.
    #[instrument(skip(self), fields(task = %task_id, agent = agent_id))]
    pub async fn assign(&self, task_id: Uuid, job_id: Uuid, agent_id: i64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        let task_moved = transaction
            .execute(queries::ASSIGN, params![agent_id, task_id.to_string()])
            .await?;
        if task_moved == 0 {
            return Err(DbError::Conflict(format!("task {task_id} is not pending")));
        }

        let agent_taken = transaction
            .execute(
                queries::OCCUPY_AGENT,
                params![task_id.to_string(), job_id.to_string(), agent_id],
            )
            .await?;
        if agent_taken == 0 {
            return Err(DbError::Conflict(format!("agent {agent_id} is already busy")));
        }

        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(())
    }

    /// Rolls an `assigned` task back to `pending` and frees the agent after
    /// a failed assignment send.
    pub async fn revert_assignment(&self, task_id: Uuid, agent_id: i64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        transaction
            .execute(queries::REVERT_ASSIGNMENT, params![task_id.to_string()])
            .await?;
        transaction
            .execute(queries::RELEASE_AGENT, params![agent_id, task_id.to_string()])
            .await?;
        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(())
    }

    /// Returns true when this call performed the assigned → running
    /// promotion (i.e. it saw the first progress report).
    pub async fn promote_running(&self, task_id: Uuid) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(queries::PROMOTE_RUNNING, params![task_id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    /// Terminal execution with cracks still in flight: the task parks in
    /// `processing` and the agent is released to take new work.
    #[instrument(skip(self), fields(task = %task_id))]
    pub async fn enter_processing(
        &self,
        task_id: Uuid,
        agent_id: i64,
        expected_crack_count: u64,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        let moved = transaction
            .execute(
                queries::SET_PROCESSING,
                params![expected_crack_count as i64, task_id.to_string()],
            )
            .await?;
        if moved == 0 {
            return Err(DbError::Conflict(format!("task {task_id} cannot enter processing")));
        }
        transaction
            .execute(queries::RELEASE_AGENT, params![agent_id, task_id.to_string()])
            .await?;
        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(())
    }

    pub async fn update_expected_cracks(
        &self,
        task_id: Uuid,
        expected: u64,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::UPDATE_EXPECTED_CRACKS,
                params![expected as i64, task_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn add_received_cracks(&self, task_id: Uuid, delta: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::ADD_RECEIVED_CRACKS,
                params![delta as i64, task_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn signal_batches_complete(&self, task_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::SIGNAL_BATCHES_COMPLETE, params![task_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn increment_retransmits(&self, task_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::INCREMENT_RETRANSMITS, params![task_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn store_chunk_actual(&self, task_id: Uuid, actual: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::STORE_CHUNK_ACTUAL,
                params![actual as i64, task_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn set_effective_window(
        &self,
        task_id: Uuid,
        start: u64,
        end: u64,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::SET_EFFECTIVE_WINDOW,
                params![start as i64, end as i64, task_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn set_detailed_status(&self, task_id: Uuid, detail: &str) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::SET_DETAILED_STATUS,
                params![detail, task_id.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Terminal transition releasing the agent atomically. `final_status`
    /// must be terminal; passing a live status is a programming error and is
    /// rejected.
    #[instrument(skip(self), fields(task = %task_id, status = final_status.as_str()))]
    pub async fn finish(
        &self,
        task_id: Uuid,
        agent_id: Option<i64>,
        final_status: TaskStatus,
    ) -> Result<bool, DbError> {
        if !final_status.is_terminal() {
            return Err(DbError::Conflict(format!(
                "finish() requires a terminal status, got {}",
                final_status.as_str()
            )));
        }
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        let moved = transaction
            .execute(
                queries::COMPLETE,
                params![final_status.as_str(), task_id.to_string()],
            )
            .await?;
        if moved == 0 {
            warn!("[TASKS]: finish on {task_id} found no live row");
            return Ok(false);
        }
        if let Some(agent_id) = agent_id {
            transaction
                .execute(queries::RELEASE_AGENT, params![agent_id, task_id.to_string()])
                .await?;
        }
        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(true)
    }

    /// Parks every live chunk of a disconnecting agent and frees the agent
    /// row. Returns the parked task ids.
    #[instrument(skip(self), fields(agent = agent_id))]
    pub async fn park_for_reconnect(&self, agent_id: i64) -> Result<Vec<Uuid>, DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        transaction
            .execute(queries::PARK_FOR_RECONNECT, params![agent_id])
            .await?;
        transaction
            .execute(
                "UPDATE agents SET busy = 0, current_task_id = NULL, current_job_id = NULL
                 WHERE id = ?1",
                params![agent_id],
            )
            .await?;
        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        let mut rows = connection
            .query(queries::SELECT_PARKED_FOR_AGENT, params![agent_id])
            .await?;
        let mut parked = Vec::new();
        while let Some(row) = rows.next().await? {
            parked.push(parse_uuid(&row.get::<String>(0)?)?);
        }
        Ok(parked)
    }

    /// Parked tasks belonging to a reconnecting agent, with retry counts.
    pub async fn parked_for_agent(&self, agent_id: i64) -> Result<Vec<(Uuid, u32)>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_PARKED_FOR_AGENT, params![agent_id])
            .await?;
        let mut parked = Vec::new();
        while let Some(row) = rows.next().await? {
            parked.push((
                parse_uuid(&row.get::<String>(0)?)?,
                row.get::<i64>(1)? as u32,
            ));
        }
        Ok(parked)
    }

    /// Parked tasks whose grace window expired.
    pub async fn parked_expired(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Uuid>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                queries::SELECT_PARKED_EXPIRED,
                params![older_than.format("%Y-%m-%d %H:%M:%S").to_string()],
            )
            .await?;
        let mut expired = Vec::new();
        while let Some(row) = rows.next().await? {
            expired.push(parse_uuid(&row.get::<String>(0)?)?);
        }
        Ok(expired)
    }

    /// Restores a parked chunk to the agent that kept running it through a
    /// disconnect, re-occupying the agent in the same transaction.
    pub async fn reclaim_parked(&self, task_id: Uuid, agent_id: i64, job_id: Uuid) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        let reclaimed = transaction
            .execute(queries::RECLAIM_PARKED, params![agent_id, task_id.to_string()])
            .await?;
        if reclaimed == 0 {
            return Ok(false);
        }
        let occupied = transaction
            .execute(
                queries::OCCUPY_AGENT,
                params![task_id.to_string(), job_id.to_string(), agent_id],
            )
            .await?;
        if occupied == 0 {
            return Err(DbError::Conflict(format!(
                "agent {agent_id} busy while reclaiming {task_id}"
            )));
        }
        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(true)
    }

    /// Returns the parked task to the pending pool, bumping its retry count.
    pub async fn reset_for_retry(&self, task_id: Uuid) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(queries::RESET_FOR_RETRY, params![task_id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    pub async fn fail_permanently(&self, task_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::FAIL_PERMANENTLY, params![task_id.to_string()])
            .await?;
        Ok(())
    }
}

fn map_task_row(row: Row) -> Result<JobTask, DbError> {
    let status_raw = row.get::<String>(4)?;
    Ok(JobTask {
        id: parse_uuid(&row.get::<String>(0)?)?,
        job_id: parse_uuid(&row.get::<String>(1)?)?,
        layer_id: parse_optional_uuid(opt_text(&row, 2))?,
        agent_id: opt_int(&row, 3),
        status: TaskStatus::parse(&status_raw)
            .ok_or_else(|| mapping_error("task status", &status_raw))?,
        keyspace_start: as_u64(row.get::<i64>(5)?),
        keyspace_end: as_u64(row.get::<i64>(6)?),
        effective_keyspace_start: opt_u64(opt_int(&row, 7)),
        effective_keyspace_end: opt_u64(opt_int(&row, 8)),
        chunk_actual_keyspace: opt_u64(opt_int(&row, 9)),
        is_keyspace_split: row.get::<i64>(10)? != 0,
        is_rule_split: row.get::<i64>(11)? != 0,
        rule_chunk_path: opt_text(&row, 12),
        rule_start_index: opt_int(&row, 13).map(|value| value as u32),
        rule_end_index: opt_int(&row, 14).map(|value| value as u32),
        expected_crack_count: as_u64(row.get::<i64>(15)?),
        received_crack_count: as_u64(row.get::<i64>(16)?),
        batches_complete_signaled: row.get::<i64>(17)? != 0,
        retry_count: row.get::<i64>(18)? as u32,
        retransmit_count: row.get::<i64>(19)? as u32,
        detailed_status: opt_text(&row, 20),
        created_at: parse_timestamp(&row.get::<String>(21)?)?,
        updated_at: parse_timestamp(&row.get::<String>(22)?)?,
    })
}
