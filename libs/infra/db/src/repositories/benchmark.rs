// [libs/infra/db/src/repositories/benchmark.rs]
//! Benchmark speeds and the request rows the scheduler polls while a
//! benchmark round is in flight.

use chrono::{DateTime, Utc};
use libsql::params;
use tracing::instrument;
use uuid::Uuid;

use krakenhashes_models::AgentBenchmark;

use crate::client::DbClient;
use crate::errors::DbError;

use super::{as_u64, opt_text, parse_timestamp, parse_uuid};

pub struct BenchmarkRepository {
    database_client: DbClient,
}

impl BenchmarkRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    #[instrument(skip(self), fields(agent = agent_id, hash_type))]
    pub async fn record_speed(
        &self,
        agent_id: i64,
        attack_mode: u8,
        hash_type: u32,
        salt_count: Option<u64>,
        speed: u64,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "INSERT INTO agent_benchmarks (agent_id, attack_mode, hash_type, salt_key, speed, measured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
                 ON CONFLICT (agent_id, attack_mode, hash_type, salt_key)
                 DO UPDATE SET speed = excluded.speed, measured_at = CURRENT_TIMESTAMP",
                params![
                    agent_id,
                    attack_mode as i64,
                    hash_type as i64,
                    AgentBenchmark::salt_key(salt_count),
                    speed as i64
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_speed(
        &self,
        agent_id: i64,
        attack_mode: u8,
        hash_type: u32,
        salt_count: Option<u64>,
    ) -> Result<Option<AgentBenchmark>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                "SELECT agent_id, attack_mode, hash_type, salt_key, speed, measured_at
                 FROM agent_benchmarks
                 WHERE agent_id = ?1 AND attack_mode = ?2 AND hash_type = ?3 AND salt_key = ?4",
                params![
                    agent_id,
                    attack_mode as i64,
                    hash_type as i64,
                    AgentBenchmark::salt_key(salt_count)
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let salt_key = row.get::<i64>(3)?;
                Ok(Some(AgentBenchmark {
                    agent_id: row.get::<i64>(0)?,
                    attack_mode: row.get::<i64>(1)? as u8,
                    hash_type: row.get::<i64>(2)? as u32,
                    salt_count: if salt_key < 0 { None } else { Some(salt_key as u64) },
                    speed: as_u64(row.get::<i64>(4)?),
                    measured_at: parse_timestamp(&row.get::<String>(5)?)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// A usable benchmark exists and is inside the cache window.
    pub async fn has_fresh_speed(
        &self,
        agent_id: i64,
        attack_mode: u8,
        hash_type: u32,
        salt_count: Option<u64>,
        now: DateTime<Utc>,
        cache_duration_hours: i64,
    ) -> Result<bool, DbError> {
        Ok(self
            .get_speed(agent_id, attack_mode, hash_type, salt_count)
            .await?
            .map(|benchmark| !benchmark.is_stale(now, cache_duration_hours))
            .unwrap_or(false))
    }

    // --- request rows -------------------------------------------------------

    pub async fn create_request(
        &self,
        request_id: Uuid,
        agent_id: i64,
        job_id: Option<Uuid>,
        layer_id: Option<Uuid>,
        attack_mode: u8,
        hash_type: u32,
        salt_count: Option<u64>,
        forced: bool,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "INSERT INTO benchmark_requests
                 (id, agent_id, job_id, layer_id, attack_mode, hash_type, salt_key, forced)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    request_id.to_string(),
                    agent_id,
                    job_id.map(|id| id.to_string()),
                    layer_id.map(|id| id.to_string()),
                    attack_mode as i64,
                    hash_type as i64,
                    AgentBenchmark::salt_key(salt_count),
                    forced as i64
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn complete_request(&self, request_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE benchmark_requests
                 SET status = 'completed', completed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status = 'pending'",
                params![request_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn fail_request(&self, request_id: Uuid) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "UPDATE benchmark_requests
                 SET status = 'failed', completed_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status = 'pending'",
                params![request_id.to_string()],
            )
            .await?;
        Ok(())
    }

    /// How many of the given requests are still pending; the scheduler polls
    /// this while a benchmark round blocks the cycle.
    pub async fn pending_count(&self, request_ids: &[Uuid]) -> Result<u64, DbError> {
        if request_ids.is_empty() {
            return Ok(0);
        }
        let connection = self.database_client.connection()?;
        let placeholders: Vec<String> =
            (1..=request_ids.len()).map(|index| format!("?{index}")).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM benchmark_requests WHERE status = 'pending' AND id IN ({})",
            placeholders.join(", ")
        );
        let ids: Vec<libsql::Value> = request_ids
            .iter()
            .map(|id| libsql::Value::from(id.to_string()))
            .collect();
        let mut rows = connection.query(&sql, ids).await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("benchmark_requests"))?;
        Ok(as_u64(row.get::<i64>(0)?))
    }

    /// Agents locked by a still-pending benchmark request.
    pub async fn agents_with_pending_requests(&self) -> Result<Vec<i64>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                "SELECT DISTINCT agent_id FROM benchmark_requests WHERE status = 'pending'",
                (),
            )
            .await?;
        let mut agents = Vec::new();
        while let Some(row) = rows.next().await? {
            agents.push(row.get::<i64>(0)?);
        }
        Ok(agents)
    }

    /// Looks up the request row for a reported result.
    pub async fn request_context(
        &self,
        request_id: Uuid,
    ) -> Result<Option<(i64, Option<Uuid>, Option<Uuid>, bool)>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                "SELECT agent_id, job_id, layer_id, forced FROM benchmark_requests WHERE id = ?1",
                params![request_id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let job_id = match opt_text(&row, 1) {
                    Some(raw) => Some(parse_uuid(&raw)?),
                    None => None,
                };
                let layer_id = match opt_text(&row, 2) {
                    Some(raw) => Some(parse_uuid(&raw)?),
                    None => None,
                };
                Ok(Some((
                    row.get::<i64>(0)?,
                    job_id,
                    layer_id,
                    row.get::<i64>(3)? != 0,
                )))
            }
            None => Ok(None),
        }
    }
}
