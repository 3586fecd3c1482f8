// [libs/infra/db/src/repositories/hash/mod.rs]
//! The deduplicated hash store. Crack application is the hottest write path
//! in the system: transactional mini-batches, rows_affected accounting, a
//! transient-fault retry ladder, and LM half bookkeeping all live here.

pub mod queries;

use std::collections::HashSet;
use std::time::Duration;

use libsql::{params, Connection, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use krakenhashes_models::messages::CrackedHash;
use krakenhashes_models::{Hashlist, LmMetadata, LM_BLANK_HALF};

use crate::client::DbClient;
use crate::errors::DbError;

use super::{as_u64, opt_text, parse_timestamp, parse_uuid};

/// Rows per crack-application transaction.
pub const CRACK_MINI_BATCH: usize = 20_000;
/// Rows per retransmit save chunk, bounded by the statement parameter limit.
pub const RETRANSMIT_CHUNK: usize = 10_000;
/// Backoff ladder for transient faults, then the batch fails for real.
const RETRY_DELAYS_MS: [u64; 3] = [0, 1_000, 2_000];

/// Result of applying one crack batch.
#[derive(Debug, Default, Clone)]
pub struct CrackOutcome {
    /// Hashes newly flipped to cracked (rows_affected, not batch length).
    pub newly_cracked: u64,
    /// Submitted lines recorded for the task, duplicates excluded.
    pub recorded_for_task: u64,
    /// Every hashlist containing at least one newly cracked hash.
    pub affected_hashlists: Vec<Uuid>,
}

pub struct HashRepository {
    database_client: DbClient,
}

impl HashRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    // --- ingestion fixtures -------------------------------------------------

    pub async fn create_hashlist(
        &self,
        hashlist_id: Uuid,
        name: &str,
        hash_type_id: u32,
        original_file_path: Option<&str>,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::INSERT_HASHLIST,
                params![
                    hashlist_id.to_string(),
                    name,
                    hash_type_id as i64,
                    0i64,
                    original_file_path
                ],
            )
            .await?;
        Ok(())
    }

    /// Inserts (or reuses) the canonical hash row and links it to the
    /// hashlist, bumping the list total only for fresh links.
    pub async fn add_hash(
        &self,
        hashlist_id: Uuid,
        hash_value: &str,
        hash_type_id: u32,
        original_line: Option<&str>,
        username: Option<&str>,
    ) -> Result<Uuid, DbError> {
        let connection = self.database_client.connection()?;
        let candidate_id = Uuid::new_v4();
        connection
            .execute(
                queries::INSERT_HASH,
                params![
                    candidate_id.to_string(),
                    hash_value,
                    original_line,
                    username,
                    Option::<String>::None,
                    hash_type_id as i64
                ],
            )
            .await?;

        let mut rows = connection
            .query(queries::SELECT_HASH_ID_BY_VALUE, params![hash_value])
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("hash"))?;
        let hash_id = parse_uuid(&row.get::<String>(0)?)?;

        let linked = connection
            .execute(
                queries::LINK_HASH,
                params![hashlist_id.to_string(), hash_id.to_string()],
            )
            .await?;
        if linked > 0 {
            connection
                .execute(
                    "UPDATE hashlists SET total = total + 1 WHERE id = ?1",
                    params![hashlist_id.to_string()],
                )
                .await?;
        }
        Ok(hash_id)
    }

    pub async fn get_hashlist(&self, hashlist_id: Uuid) -> Result<Hashlist, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_HASHLIST, params![hashlist_id.to_string()])
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("hashlist"))?;
        Ok(Hashlist {
            id: parse_uuid(&row.get::<String>(0)?)?,
            hash_type_id: row.get::<i64>(1)? as u32,
            total: as_u64(row.get::<i64>(2)?),
            cracked_count: as_u64(row.get::<i64>(3)?),
            file_md5: opt_text(&row, 4),
            has_mixed_work_factors: row.get::<i64>(5)? != 0,
            original_file_path: opt_text(&row, 6),
            updated_at: parse_timestamp(&row.get::<String>(7)?)?,
        })
    }

    // --- crack application --------------------------------------------------

    /// Applies a crack batch in transactional mini-batches with the
    /// transient-fault retry ladder. Safe to re-deliver: the per-task ledger
    /// and the `is_cracked = 0` guard make duplicates no-ops.
    #[instrument(skip(self, cracks), fields(task = %task_id, batch = cracks.len()))]
    pub async fn apply_crack_batch(
        &self,
        task_id: Uuid,
        cracks: &[CrackedHash],
    ) -> Result<CrackOutcome, DbError> {
        self.apply_in_chunks(task_id, cracks, CRACK_MINI_BATCH).await
    }

    /// Retransmit save path: smaller chunks, same semantics.
    pub async fn apply_retransmit_collection(
        &self,
        task_id: Uuid,
        cracks: &[CrackedHash],
    ) -> Result<CrackOutcome, DbError> {
        self.apply_in_chunks(task_id, cracks, RETRANSMIT_CHUNK).await
    }

    async fn apply_in_chunks(
        &self,
        task_id: Uuid,
        cracks: &[CrackedHash],
        chunk_size: usize,
    ) -> Result<CrackOutcome, DbError> {
        let mut outcome = CrackOutcome::default();
        if cracks.is_empty() {
            return Ok(outcome);
        }

        let mut affected: HashSet<Uuid> = HashSet::new();
        for chunk in cracks.chunks(chunk_size) {
            let chunk_outcome = self.apply_mini_batch_with_retry(task_id, chunk).await?;
            outcome.newly_cracked += chunk_outcome.newly_cracked;
            outcome.recorded_for_task += chunk_outcome.recorded_for_task;
            affected.extend(chunk_outcome.affected_hashlists);
        }

        outcome.affected_hashlists = affected.into_iter().collect();
        outcome.affected_hashlists.sort();

        // Counter maintenance after the data is committed.
        let connection = self.database_client.connection()?;
        for hashlist_id in &outcome.affected_hashlists {
            connection
                .execute(
                    queries::RECOMPUTE_HASHLIST_CRACKED,
                    params![hashlist_id.to_string()],
                )
                .await?;
        }
        Ok(outcome)
    }

    async fn apply_mini_batch_with_retry(
        &self,
        task_id: Uuid,
        chunk: &[CrackedHash],
    ) -> Result<CrackOutcome, DbError> {
        let mut last_error: Option<DbError> = None;
        for delay_ms in RETRY_DELAYS_MS {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            match self.apply_mini_batch(task_id, chunk).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error.is_transient() => {
                    warn!("[CRACKS]: transient fault on mini-batch, retrying: {error}");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or(DbError::Transaction("mini-batch retries exhausted".into())))
    }

    async fn apply_mini_batch(
        &self,
        task_id: Uuid,
        chunk: &[CrackedHash],
    ) -> Result<CrackOutcome, DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        let mut outcome = CrackOutcome::default();
        let mut affected_hashes: Vec<String> = Vec::new();

        for crack in chunk {
            let recorded = transaction
                .execute(
                    queries::RECORD_TASK_CRACK,
                    params![task_id.to_string(), crack.hash.clone(), crack.plain.clone()],
                )
                .await?;
            outcome.recorded_for_task += recorded;

            let cracked = transaction
                .execute(
                    queries::CRACK_BY_VALUE,
                    params![crack.plain.clone(), crack.hash.clone()],
                )
                .await?;

            if cracked > 0 {
                outcome.newly_cracked += cracked;
                affected_hashes.push(crack.hash.clone());
            } else if crack.hash.len() == 16 {
                // Not a known full hash: try it as an LM half.
                let lm_completed =
                    apply_lm_half(&transaction, &crack.hash, &crack.plain).await?;
                outcome.newly_cracked += lm_completed.newly_cracked as u64;
                affected_hashes.extend(lm_completed.touched_values);
            }
        }

        let mut affected_lists = HashSet::new();
        for value in &affected_hashes {
            for hashlist_id in hashlists_containing_value(&transaction, value).await? {
                affected_lists.insert(hashlist_id);
            }
        }

        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;

        outcome.affected_hashlists = affected_lists.into_iter().collect();
        debug!(
            "[CRACKS]: mini-batch applied: {} new, {} recorded",
            outcome.newly_cracked, outcome.recorded_for_task
        );
        Ok(outcome)
    }

    // --- verification reads -------------------------------------------------

    /// The authoritative crack count for completion verification. The task's
    /// `received_crack_count` is incremented by nominal batch sizes and can
    /// overcount; this count cannot.
    pub async fn cracked_count_for_task(&self, task_id: Uuid) -> Result<u64, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::COUNT_TASK_CRACKS, params![task_id.to_string()])
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("task"))?;
        Ok(as_u64(row.get::<i64>(0)?))
    }

    /// One-shot bulk load for the retransmit dedup pass.
    pub async fn crack_values_for_task(&self, task_id: Uuid) -> Result<HashSet<String>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_TASK_CRACK_VALUES, params![task_id.to_string()])
            .await?;
        let mut values = HashSet::new();
        while let Some(row) = rows.next().await? {
            values.insert(row.get::<String>(0)?);
        }
        Ok(values)
    }

    // --- regeneration reads -------------------------------------------------

    /// Uncracked values for a hashlist in deterministic order.
    pub async fn uncracked_values(&self, hashlist_id: Uuid) -> Result<Vec<String>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(queries::SELECT_UNCRACKED_VALUES, params![hashlist_id.to_string()])
            .await?;
        let mut values = Vec::new();
        while let Some(row) = rows.next().await? {
            values.push(row.get::<String>(0)?);
        }
        Ok(values)
    }

    /// LM serving set: every distinct still-needed 16-char half, the blank
    /// half at most once, halves already cracked omitted.
    pub async fn uncracked_lm_halves(&self, hashlist_id: Uuid) -> Result<Vec<String>, DbError> {
        let connection = self.database_client.connection()?;
        let mut lm_rows: Vec<(Uuid, String)> = Vec::new();
        {
            let mut rows = connection
                .query(queries::SELECT_UNCRACKED_LM_HASHES, params![hashlist_id.to_string()])
                .await?;
            while let Some(row) = rows.next().await? {
                lm_rows.push((parse_uuid(&row.get::<String>(0)?)?, row.get::<String>(1)?));
            }
        }

        let mut halves: HashSet<String> = HashSet::new();
        for (hash_id, value) in lm_rows {
            if value.len() != 32 {
                continue;
            }
            let (first, second) = value.split_at(16);
            let metadata = self.lm_metadata(&connection, hash_id).await?;
            if !metadata.first_half_cracked {
                halves.insert(first.to_string());
            }
            if !metadata.second_half_cracked {
                halves.insert(second.to_string());
            }
        }

        let mut sorted: Vec<String> = halves.into_iter().collect();
        sorted.sort();
        Ok(sorted)
    }

    async fn lm_metadata(
        &self,
        connection: &Connection,
        hash_id: Uuid,
    ) -> Result<LmMetadata, DbError> {
        let mut rows = connection
            .query(queries::SELECT_LM_METADATA, params![hash_id.to_string()])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(LmMetadata {
                hash_id,
                first_half_cracked: row.get::<i64>(0)? != 0,
                second_half_cracked: row.get::<i64>(1)? != 0,
                first_half_plain: opt_text(&row, 2),
                second_half_plain: opt_text(&row, 3),
            }),
            None => Ok(LmMetadata { hash_id, ..LmMetadata::default() }),
        }
    }

    pub async fn set_hashlist_file_md5(
        &self,
        hashlist_id: Uuid,
        md5: &str,
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                queries::SET_HASHLIST_MD5,
                params![md5, hashlist_id.to_string()],
            )
            .await?;
        connection
            .execute(
                queries::INVALIDATE_AGENT_HASHLIST,
                params![format!("{hashlist_id}.hash")],
            )
            .await?;
        Ok(())
    }
}

struct LmHalfOutcome {
    newly_cracked: usize,
    /// Full hash values whose state changed; feeds hashlist invalidation.
    touched_values: Vec<String>,
}

/// Records one cracked LM half against every uncracked LM hash containing
/// it. The constant blank half auto-completes its side, and a hash flips to
/// cracked exactly when both halves are known.
async fn apply_lm_half(
    transaction: &Transaction,
    half: &str,
    plain: &str,
) -> Result<LmHalfOutcome, DbError> {
    let mut candidates = Vec::new();
    {
        let mut rows = transaction
            .query(queries::SELECT_LM_CANDIDATES_FOR_HALF, params![half])
            .await?;
        while let Some(row) = rows.next().await? {
            let id = parse_uuid(&row.get::<String>(0)?)?;
            let value = row.get::<String>(1)?;
            candidates.push((id, value));
        }
    }

    let mut outcome = LmHalfOutcome { newly_cracked: 0, touched_values: Vec::new() };

    for (hash_id, hash_value) in candidates {
        if hash_value.len() != 32 {
            continue;
        }
        let (first, second) = hash_value.split_at(16);

        transaction
            .execute(queries::UPSERT_LM_METADATA, params![hash_id.to_string()])
            .await?;

        let mut halves_updated = 0u64;
        if first == half {
            halves_updated += transaction
                .execute(queries::SET_LM_FIRST_HALF, params![plain, hash_id.to_string()])
                .await?;
        }
        if second == half {
            halves_updated += transaction
                .execute(queries::SET_LM_SECOND_HALF, params![plain, hash_id.to_string()])
                .await?;
        }

        // Blank-half auto-completion for the untouched side.
        if first == LM_BLANK_HALF {
            halves_updated += transaction
                .execute(queries::SET_LM_FIRST_HALF, params!["", hash_id.to_string()])
                .await?;
        }
        if second == LM_BLANK_HALF {
            halves_updated += transaction
                .execute(queries::SET_LM_SECOND_HALF, params!["", hash_id.to_string()])
                .await?;
        }

        // Any newly known half changes the served half set, so the hashlists
        // containing this hash must regenerate even before full completion.
        if halves_updated > 0 {
            outcome.touched_values.push(hash_value.clone());
        }

        let mut rows = transaction
            .query(queries::SELECT_LM_METADATA, params![hash_id.to_string()])
            .await?;
        if let Some(row) = rows.next().await? {
            let first_done = row.get::<i64>(0)? != 0;
            let second_done = row.get::<i64>(1)? != 0;
            if first_done && second_done {
                let joined = format!(
                    "{}{}",
                    opt_text(&row, 2).unwrap_or_default(),
                    opt_text(&row, 3).unwrap_or_default()
                );
                let flipped = transaction
                    .execute(queries::CRACK_BY_ID, params![joined, hash_id.to_string()])
                    .await?;
                if flipped > 0 {
                    outcome.newly_cracked += 1;
                    outcome.touched_values.push(hash_value.clone());
                }
            }
        }
    }

    Ok(outcome)
}

async fn hashlists_containing_value(
    transaction: &Transaction,
    hash_value: &str,
) -> Result<Vec<Uuid>, DbError> {
    let mut rows = transaction
        .query(
            "SELECT DISTINCT hh.hashlist_id
             FROM hashlist_hashes hh
             JOIN hashes h ON h.id = hh.hash_id
             WHERE h.hash_value = ?1",
            params![hash_value],
        )
        .await?;
    let mut lists = Vec::new();
    while let Some(row) = rows.next().await? {
        lists.push(parse_uuid(&row.get::<String>(0)?)?);
    }
    Ok(lists)
}
