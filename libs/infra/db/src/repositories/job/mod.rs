// [libs/infra/db/src/repositories/job/mod.rs]
//! Job execution ledger: scheduling views, keyspace counters, increment
//! layers, completion flags.

pub mod queries;

use libsql::{params, Row};
use tracing::instrument;
use uuid::Uuid;

use krakenhashes_models::{
    AttackMode, IncrementLayer, IncrementMode, JobExecution, JobStatus,
};

use crate::client::DbClient;
use crate::errors::{mapping_error, DbError};

use super::{as_u64, opt_int, opt_real, opt_text, opt_u64, parse_timestamp, parse_uuid};

pub struct JobRepository {
    database_client: DbClient,
}

impl JobRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    #[instrument(skip(self, job), fields(job = %job.id))]
    pub async fn create(&self, job: &JobExecution) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let wordlists = serde_json::to_string(&job.wordlist_ids)
            .map_err(|error| mapping_error("wordlist_ids", error))?;
        let rules = serde_json::to_string(&job.rule_ids)
            .map_err(|error| mapping_error("rule_ids", error))?;

        connection
            .execute(
                queries::INSERT_JOB,
                params![
                    job.id.to_string(),
                    job.hashlist_id.to_string(),
                    job.attack_mode.as_u8() as i64,
                    job.hash_type as i64,
                    job.mask.clone(),
                    wordlists,
                    rules,
                    job.assoc_wordlist_id,
                    job.priority as i64,
                    job.max_agents as i64,
                    job.binary_pattern.clone(),
                    job.status.as_str(),
                    job.base_keyspace.map(|value| value as i64),
                    job.effective_keyspace.map(|value| value as i64),
                    job.multiplication_factor as i64,
                    job.is_accurate_keyspace as i64,
                    job.uses_rule_splitting as i64,
                    job.rule_split_count as i64,
                    job.avg_rule_multiplier,
                    job.increment_mode.as_str(),
                    job.increment_min.map(|value| value as i64),
                    job.increment_max.map(|value| value as i64),
                    job.dispatched_keyspace as i64,
                    job.processed_keyspace as i64,
                    job.completion_email_sent as i64
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<JobExecution, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                &format!("{} WHERE id = ?1", queries::SELECT_JOB),
                params![job_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => map_job_row(row),
            None => Err(DbError::NotFound("job")),
        }
    }

    /// Jobs worth scheduling this cycle, priority-then-FIFO ordered.
    pub async fn schedulable(&self) -> Result<Vec<JobExecution>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection.query(queries::SELECT_SCHEDULABLE, ()).await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(map_job_row(row)?);
        }
        Ok(jobs)
    }

    pub async fn live_assignment_count(&self, job_id: Uuid) -> Result<u64, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::COUNT_LIVE_TASKS, params![job_id.to_string()])
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("job"))?;
        Ok(as_u64(row.get::<i64>(0)?))
    }

    pub async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::SET_STATUS, params![status.as_str(), job_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn mark_started(&self, job_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::MARK_STARTED, params![job_id.to_string()])
            .await?;
        Ok(())
    }

    /// First-benchmark calibration: stores the true effective keyspace and
    /// derives the rule multiplier when base and rule count are known.
    #[instrument(skip(self), fields(job = %job_id))]
    pub async fn calibrate_keyspace(
        &self,
        job_id: Uuid,
        effective_keyspace: u64,
        avg_rule_multiplier: Option<f64>,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::CALIBRATE_KEYSPACE,
                params![effective_keyspace as i64, avg_rule_multiplier, job_id.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Progressive refinement write; keeps `is_accurate_keyspace` as-is.
    pub async fn set_effective_keyspace(
        &self,
        job_id: Uuid,
        effective_keyspace: u64,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::SET_EFFECTIVE_KEYSPACE,
                params![effective_keyspace as i64, job_id.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Flips a job to rule splitting exactly once; later calls are no-ops.
    pub async fn enable_rule_splitting(
        &self,
        job_id: Uuid,
        split_count: u32,
    ) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(
                queries::ENABLE_RULE_SPLITTING,
                params![split_count as i64, job_id.to_string()],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn add_dispatched(&self, job_id: Uuid, delta: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::ADD_DISPATCHED, params![delta as i64, job_id.to_string()])
            .await?;
        Ok(())
    }

    /// Reverts a dispatch after a failed assignment send.
    pub async fn roll_back_dispatched(&self, job_id: Uuid, delta: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::ROLL_BACK_DISPATCHED, params![delta as i64, job_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn set_processed(&self, job_id: Uuid, processed: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::SET_PROCESSED, params![processed as i64, job_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn sync_keyspace_to_processed(&self, job_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::SYNC_KEYSPACE_TO_PROCESSED, params![job_id.to_string()])
            .await?;
        Ok(())
    }

    /// Live jobs targeting a hashlist, for the completion fan-out.
    pub async fn live_jobs_for_hashlist(
        &self,
        hashlist_id: Uuid,
    ) -> Result<Vec<(Uuid, JobStatus)>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_FOR_HASHLIST, params![hashlist_id.to_string()])
            .await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            let id = parse_uuid(&row.get::<String>(0)?)?;
            let status_raw = row.get::<String>(1)?;
            let status = JobStatus::parse(&status_raw)
                .ok_or_else(|| mapping_error("job status", &status_raw))?;
            jobs.push((id, status));
        }
        Ok(jobs)
    }

    /// Deletes a never-started job. Refuses anything not pending.
    pub async fn delete_pending(&self, job_id: Uuid) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(queries::DELETE_JOB, params![job_id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    /// Returns true exactly once per job; the guard makes the completion
    /// notification single-shot.
    pub async fn claim_completion_email(&self, job_id: Uuid) -> Result<bool, DbError> {
        let connection = self.database_client.connection()?;
        let affected = connection
            .execute(queries::CLAIM_COMPLETION_EMAIL, params![job_id.to_string()])
            .await?;
        Ok(affected > 0)
    }

    // --- increment layers ---

    pub async fn create_layer(&self, layer: &IncrementLayer) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::INSERT_LAYER,
                params![
                    layer.id.to_string(),
                    layer.job_id.to_string(),
                    layer.mask_length as i64,
                    layer.layer_mask.clone(),
                    layer.base_keyspace.map(|value| value as i64),
                    layer.effective_keyspace.map(|value| value as i64)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn layers_for_job(&self, job_id: Uuid) -> Result<Vec<IncrementLayer>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_LAYERS, params![job_id.to_string()])
            .await?;
        let mut layers = Vec::new();
        while let Some(row) = rows.next().await? {
            layers.push(map_layer_row(row)?);
        }
        Ok(layers)
    }

    pub async fn calibrate_layer(&self, layer_id: Uuid, effective: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::CALIBRATE_LAYER, params![effective as i64, layer_id.to_string()])
            .await?;
        Ok(())
    }

    pub async fn add_layer_dispatched(&self, layer_id: Uuid, delta: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::ADD_LAYER_DISPATCHED,
                params![delta as i64, layer_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn roll_back_layer_dispatched(
        &self,
        layer_id: Uuid,
        delta: u64,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::ROLL_BACK_LAYER_DISPATCHED,
                params![delta as i64, layer_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn set_layer_processed(&self, layer_id: Uuid, processed: u64) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::SET_LAYER_PROCESSED,
                params![processed as i64, layer_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn set_layer_status(&self, layer_id: Uuid, status: JobStatus) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::SET_LAYER_STATUS,
                params![status.as_str(), layer_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_layer_started(&self, layer_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(queries::MARK_LAYER_STARTED, params![layer_id.to_string()])
            .await?;
        Ok(())
    }
}

fn map_job_row(row: Row) -> Result<JobExecution, DbError> {
    let attack_raw = row.get::<i64>(2)? as u8;
    let status_raw = row.get::<String>(11)?;
    let increment_raw = row.get::<String>(19)?;
    let wordlists_raw = row.get::<String>(5)?;
    let rules_raw = row.get::<String>(6)?;

    Ok(JobExecution {
        id: parse_uuid(&row.get::<String>(0)?)?,
        hashlist_id: parse_uuid(&row.get::<String>(1)?)?,
        attack_mode: AttackMode::try_from(attack_raw).map_err(|e| mapping_error("attack_mode", e))?,
        hash_type: row.get::<i64>(3)? as u32,
        mask: opt_text(&row, 4),
        wordlist_ids: serde_json::from_str(&wordlists_raw)
            .map_err(|error| mapping_error("wordlist_ids", error))?,
        rule_ids: serde_json::from_str(&rules_raw)
            .map_err(|error| mapping_error("rule_ids", error))?,
        assoc_wordlist_id: opt_int(&row, 7),
        priority: row.get::<i64>(8)? as i32,
        max_agents: row.get::<i64>(9)? as u32,
        binary_pattern: row.get::<String>(10)?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| mapping_error("job status", &status_raw))?,
        base_keyspace: opt_u64(opt_int(&row, 12)),
        effective_keyspace: opt_u64(opt_int(&row, 13)),
        multiplication_factor: as_u64(row.get::<i64>(14)?),
        is_accurate_keyspace: row.get::<i64>(15)? != 0,
        uses_rule_splitting: row.get::<i64>(16)? != 0,
        rule_split_count: row.get::<i64>(17)? as u32,
        avg_rule_multiplier: opt_real(&row, 18),
        increment_mode: IncrementMode::parse(&increment_raw)
            .ok_or_else(|| mapping_error("increment_mode", &increment_raw))?,
        increment_min: opt_int(&row, 20).map(|value| value as u32),
        increment_max: opt_int(&row, 21).map(|value| value as u32),
        dispatched_keyspace: as_u64(row.get::<i64>(22)?),
        processed_keyspace: as_u64(row.get::<i64>(23)?),
        completion_email_sent: row.get::<i64>(24)? != 0,
        created_at: parse_timestamp(&row.get::<String>(25)?)?,
        started_at: opt_text(&row, 26)
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
    })
}

fn map_layer_row(row: Row) -> Result<IncrementLayer, DbError> {
    let status_raw = row.get::<String>(4)?;
    Ok(IncrementLayer {
        id: parse_uuid(&row.get::<String>(0)?)?,
        job_id: parse_uuid(&row.get::<String>(1)?)?,
        mask_length: row.get::<i64>(2)? as u32,
        layer_mask: row.get::<String>(3)?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| mapping_error("layer status", &status_raw))?,
        base_keyspace: opt_u64(opt_int(&row, 5)),
        effective_keyspace: opt_u64(opt_int(&row, 6)),
        is_accurate_keyspace: row.get::<i64>(7)? != 0,
        dispatched_keyspace: as_u64(row.get::<i64>(8)?),
        processed_keyspace: as_u64(row.get::<i64>(9)?),
        started_at: opt_text(&row, 10)
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
    })
}
