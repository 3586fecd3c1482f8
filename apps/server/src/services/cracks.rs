// [apps/server/src/services/cracks.rs]
//! Server half of the crack-delivery pipeline: batch ingestion, the
//! batches-complete verification against the database count, the retransmit
//! protocol, and the outfile delete-approval handshake.

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_db::repositories::{HashRepository, TaskRepository};
use krakenhashes_models::messages::{
    CrackBatchPayload, CrackBatchesCompletePayload, Envelope, MessageType,
    OutfileDeleteApprovedPayload, OutfileDeleteRejectedPayload, PendingOutfilesPayload,
    RequestCrackRetransmitPayload,
};
use krakenhashes_models::{JobTask, TaskStatus};

use crate::services::{regen, tasks as task_service};
use crate::state::AppState;

/// Mismatch rounds before the task is written off as `processing_error`
/// and the agent is allowed to free its disk anyway.
pub const MAX_RETRANSMIT_ROUNDS: u32 = 6;

/// Ingests one `crack_batch`. Normal batches apply immediately; retransmit
/// batches are collected for the one-shot dedup pass.
#[instrument(skip(state, batch), fields(task = %batch.task_id, size = batch.cracked_hashes.len()))]
pub async fn handle_crack_batch(state: &AppState, agent_id: i64, batch: CrackBatchPayload) {
    let tasks = TaskRepository::new(state.db.clone());
    let task = match tasks.try_get(batch.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!("[CRACKS]: batch for unknown task {}", batch.task_id);
            return;
        }
        Err(db_error) => {
            error!("[CRACKS]: batch task lookup failed: {db_error}");
            return;
        }
    };

    // Ownership is enforced for live batches only: a retransmit may arrive
    // after the task lost its agent binding.
    if !batch.is_retransmit && task.status.occupies_agent() && task.agent_id != Some(agent_id) {
        warn!(
            "[CRACKS]: agent {agent_id} submitted batch for foreign task {}; rejected",
            batch.task_id
        );
        return;
    }

    if batch.is_retransmit {
        state.retransmit.append(batch.task_id, batch.cracked_hashes);
        return;
    }

    let batch_len = batch.cracked_hashes.len() as u64;
    let hashes = HashRepository::new(state.db.clone());
    match hashes.apply_crack_batch(batch.task_id, &batch.cracked_hashes).await {
        Ok(outcome) => {
            if let Err(db_error) = tasks.add_received_cracks(batch.task_id, batch_len).await {
                error!("[CRACKS]: received counter update failed: {db_error}");
            }
            if !outcome.affected_hashlists.is_empty() {
                // Mirror of the cracker's --remove: files regenerate after
                // every committed batch.
                let regen_state = state.clone();
                let affected = outcome.affected_hashlists.clone();
                tokio::spawn(async move {
                    regen::regenerate_hashlists(&regen_state, &affected).await;
                });
            }
            debug!(
                "[CRACKS]: batch applied for {}: {} new, {} recorded",
                batch.task_id, outcome.newly_cracked, outcome.recorded_for_task
            );
        }
        Err(db_error) => {
            error!("[CRACKS]: batch application failed for {}: {db_error}", batch.task_id);
        }
    }
}

/// Terminating marker for a batch stream. Verification always uses the
/// actual database count, never the received counter.
#[instrument(skip(state, marker), fields(task = %marker.task_id, retransmit = marker.is_retransmit))]
pub async fn handle_batches_complete(
    state: &AppState,
    agent_id: i64,
    marker: CrackBatchesCompletePayload,
) {
    let tasks = TaskRepository::new(state.db.clone());
    let task = match tasks.try_get(marker.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!("[CRACKS]: batches-complete for unknown task {}", marker.task_id);
            return;
        }
        Err(db_error) => {
            error!("[CRACKS]: batches-complete lookup failed: {db_error}");
            return;
        }
    };

    if marker.is_retransmit {
        finish_retransmit_round(state, agent_id, &task).await;
        return;
    }

    if let Err(db_error) = tasks.signal_batches_complete(task.id).await {
        error!("[CRACKS]: signal write failed: {db_error}");
        return;
    }

    verify_and_settle(state, agent_id, &task).await;
}

/// Compares the database's crack count with the expectation and either
/// approves deletion, requests a retransmit, or writes the task off.
async fn verify_and_settle(state: &AppState, agent_id: i64, task: &JobTask) {
    let hashes = HashRepository::new(state.db.clone());
    let verified = match hashes.cracked_count_for_task(task.id).await {
        Ok(verified) => verified,
        Err(db_error) => {
            error!("[CRACKS]: verification count failed: {db_error}");
            return;
        }
    };
    let expected = task.expected_crack_count;

    if expected == 0 && verified == 0 {
        // Nothing was cracked; approve so the agent can clean the empty
        // outfile.
        send_delete_approval(state, agent_id, task.id, 0, true).await;
        task_service::complete_task(state, task, agent_id).await;
        return;
    }

    if verified >= expected {
        send_delete_approval(state, agent_id, task.id, verified, true).await;
        if task.status == TaskStatus::Processing {
            task_service::complete_task(state, task, agent_id).await;
        }
        return;
    }

    info!(
        "[CRACKS]: count mismatch for {}: expected {expected}, database has {verified}",
        task.id
    );
    request_retransmit(state, agent_id, task, expected).await;
}

/// One-shot dedup application of a collected retransmit stream.
async fn finish_retransmit_round(state: &AppState, agent_id: i64, task: &JobTask) {
    let collected = state.retransmit.take(task.id);
    let hashes = HashRepository::new(state.db.clone());
    let tasks = TaskRepository::new(state.db.clone());

    // Bulk-load what the task already has, once, and dedup in memory.
    let existing = match hashes.crack_values_for_task(task.id).await {
        Ok(existing) => existing,
        Err(db_error) => {
            error!("[CRACKS]: retransmit bulk load failed: {db_error}");
            return;
        }
    };
    let duplicates = collected
        .iter()
        .filter(|crack| existing.contains(&crack.hash))
        .count() as u64;
    let fresh: Vec<_> = collected
        .into_iter()
        .filter(|crack| !existing.contains(&crack.hash))
        .collect();

    let applied = if fresh.is_empty() {
        0
    } else {
        match hashes.apply_retransmit_collection(task.id, &fresh).await {
            Ok(outcome) => {
                if !outcome.affected_hashlists.is_empty() {
                    let regen_state = state.clone();
                    let affected = outcome.affected_hashlists.clone();
                    tokio::spawn(async move {
                        regen::regenerate_hashlists(&regen_state, &affected).await;
                    });
                }
                outcome.recorded_for_task
            }
            Err(db_error) => {
                error!("[CRACKS]: retransmit application failed: {db_error}");
                return;
            }
        }
    };

    let expected = task.expected_crack_count;
    info!(
        "[CRACKS]: retransmit round for {}: {duplicates} duplicates, {applied} new, expected {expected}",
        task.id
    );

    if duplicates + applied >= expected {
        let verified = hashes.cracked_count_for_task(task.id).await.unwrap_or(duplicates + applied);
        send_delete_approval(state, agent_id, task.id, verified, true).await;
        if task.status == TaskStatus::Processing {
            task_service::complete_task(state, task, agent_id).await;
        }
        return;
    }

    // Still short: drive the mismatch handler again, bounded.
    if task.retransmit_count + 1 >= MAX_RETRANSMIT_ROUNDS {
        warn!(
            "[CRACKS]: task {} exhausted {MAX_RETRANSMIT_ROUNDS} retransmit rounds, marking processing_error",
            task.id
        );
        if let Err(db_error) = tasks.finish(task.id, task.agent_id, TaskStatus::ProcessingError).await {
            error!("[CRACKS]: processing_error write failed: {db_error}");
        }
        // Data already reconciled stays in the database; let the agent
        // free its disk.
        send_delete_approval(state, agent_id, task.id, task.expected_crack_count, true).await;
        return;
    }
    request_retransmit(state, agent_id, task, expected).await;
}

/// Sends `request_crack_retransmit`, updating the expectation first so the
/// follow-up `crack_batches_complete` verifies against the right number.
async fn request_retransmit(state: &AppState, agent_id: i64, task: &JobTask, expected: u64) {
    let tasks = TaskRepository::new(state.db.clone());
    if let Err(db_error) = tasks.update_expected_cracks(task.id, expected).await {
        error!("[CRACKS]: expectation update failed: {db_error}");
        return;
    }
    if let Err(db_error) = tasks.increment_retransmits(task.id).await {
        error!("[CRACKS]: retransmit counter failed: {db_error}");
    }

    let payload = RequestCrackRetransmitPayload { task_id: task.id, expected_count: expected };
    match Envelope::new(MessageType::RequestCrackRetransmit, &payload) {
        Ok(envelope) => {
            if let Err(send_error) = state.connections.send(agent_id, envelope).await {
                warn!("[CRACKS]: retransmit request send failed: {send_error}");
            }
        }
        Err(encode_error) => error!("[CRACKS]: retransmit encode failed: {encode_error}"),
    }
}

async fn send_delete_approval(
    state: &AppState,
    agent_id: i64,
    task_id: Uuid,
    expected_line_count: u64,
    task_exists: bool,
) {
    let payload = OutfileDeleteApprovedPayload { task_id, expected_line_count, task_exists };
    match Envelope::new(MessageType::OutfileDeleteApproved, &payload) {
        Ok(envelope) => {
            if let Err(send_error) = state.connections.send(agent_id, envelope).await {
                warn!("[CRACKS]: delete approval send failed: {send_error}");
            }
        }
        Err(encode_error) => error!("[CRACKS]: approval encode failed: {encode_error}"),
    }
}

/// The agent counted its outfile and disagreed with our approval; adopt the
/// actual count and re-request a retransmit of exactly that much.
#[instrument(skip(state, rejection), fields(task = %rejection.task_id))]
pub async fn handle_delete_rejected(
    state: &AppState,
    agent_id: i64,
    rejection: OutfileDeleteRejectedPayload,
) {
    warn!(
        "[CRACKS]: delete rejected for {}: agent counted {}, we expected {} ({})",
        rejection.task_id, rejection.actual_line_count, rejection.expected_line_count, rejection.reason
    );
    let tasks = TaskRepository::new(state.db.clone());
    let task = match tasks.try_get(rejection.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return,
        Err(db_error) => {
            error!("[CRACKS]: rejection lookup failed: {db_error}");
            return;
        }
    };
    request_retransmit(state, agent_id, &task, rejection.actual_line_count).await;
}

/// Reconnect backlog: the agent lists outfiles it still holds; the current
/// task is settled first.
#[instrument(skip(state, pending), fields(agent = agent_id))]
pub async fn handle_pending_outfiles(
    state: &AppState,
    agent_id: i64,
    pending: PendingOutfilesPayload,
) {
    let mut ordered: Vec<Uuid> = Vec::new();
    if let Some(current) = pending.current_task_id {
        ordered.push(current);
    }
    for task_id in pending.task_ids {
        if Some(task_id) != pending.current_task_id {
            ordered.push(task_id);
        }
    }

    let tasks = TaskRepository::new(state.db.clone());
    let hashes = HashRepository::new(state.db.clone());

    for task_id in ordered {
        match tasks.try_get(task_id).await {
            Ok(Some(task)) => match task.status {
                TaskStatus::Completed => {
                    let verified = hashes.cracked_count_for_task(task_id).await.unwrap_or(0);
                    send_delete_approval(state, agent_id, task_id, verified, true).await;
                }
                TaskStatus::ProcessingError => {
                    send_delete_approval(state, agent_id, task_id, task.expected_crack_count, true)
                        .await;
                }
                _ => {
                    // Anything still live gets a retransmit so no crack is
                    // lost to the disconnect.
                    request_retransmit(state, agent_id, &task, task.expected_crack_count).await;
                }
            },
            Ok(None) => {
                // Orphan of a deleted job: unconditional cleanup.
                send_delete_approval(state, agent_id, task_id, 0, false).await;
            }
            Err(db_error) => error!("[CRACKS]: pending outfile lookup failed: {db_error}"),
        }
    }
}
