// [apps/server/src/handlers/dispatch.rs]
//! Inbound message handling for one agent session. The session's worker
//! task calls `handle` sequentially, which preserves per-agent ordering;
//! anything that can take long and does not depend on ordering is forked.

use tracing::{debug, error, info, instrument, warn};

use krakenhashes_db::repositories::{AgentRepository, FileRepository, TaskRepository};
use krakenhashes_models::messages::{
    BufferAckPayload, BufferedMessagesPayload, CrackBatchPayload, CrackBatchesCompletePayload,
    CurrentTaskStatusPayload, Envelope, FileSyncCommandPayload, FileSyncResponsePayload,
    FileSyncStatusPayload, HardwareInfoPayload, MessageType, OutfileDeleteRejectedPayload,
    PendingOutfilesPayload,
};
use krakenhashes_models::SyncStatus;

use crate::services::{benchmark, cracks, tasks as task_service};
use crate::state::AppState;

/// Routes one envelope from `agent_id`. Protocol errors are logged and the
/// message dropped; the connection always survives a bad payload.
#[instrument(skip(state, envelope), fields(agent = agent_id, tag = envelope.message_type.as_str()))]
pub async fn handle(state: &AppState, agent_id: i64, envelope: Envelope) {
    match envelope.message_type {
        MessageType::HardwareInfo => on_hardware_info(state, agent_id, envelope).await,
        MessageType::Heartbeat | MessageType::AgentStatus => {
            let agents = AgentRepository::new(state.db.clone());
            if let Err(db_error) = agents.touch_last_seen(agent_id).await {
                error!("[DISPATCH]: last_seen update failed: {db_error}");
            }
        }
        MessageType::JobProgress => match envelope.payload_as() {
            Ok(progress) => task_service::handle_progress(state, agent_id, progress).await,
            Err(decode_error) => warn!("[DISPATCH]: bad job_progress: {decode_error}"),
        },
        MessageType::JobStatus => match envelope.payload_as() {
            Ok(status) => task_service::handle_job_status(state, agent_id, status).await,
            Err(decode_error) => warn!("[DISPATCH]: bad job_status: {decode_error}"),
        },
        MessageType::CrackBatch => match envelope.payload_as::<CrackBatchPayload>() {
            Ok(batch) => cracks::handle_crack_batch(state, agent_id, batch).await,
            Err(decode_error) => warn!("[DISPATCH]: bad crack_batch: {decode_error}"),
        },
        MessageType::CrackBatchesComplete => {
            match envelope.payload_as::<CrackBatchesCompletePayload>() {
                Ok(marker) => cracks::handle_batches_complete(state, agent_id, marker).await,
                Err(decode_error) => warn!("[DISPATCH]: bad crack_batches_complete: {decode_error}"),
            }
        }
        MessageType::BenchmarkResult => match envelope.payload_as() {
            Ok(result) => benchmark::record_result(state, agent_id, result).await,
            Err(decode_error) => warn!("[DISPATCH]: bad benchmark_result: {decode_error}"),
        },
        MessageType::FileSyncResponse => match envelope.payload_as::<FileSyncResponsePayload>() {
            Ok(inventory) => on_file_sync_response(state, agent_id, inventory).await,
            Err(decode_error) => warn!("[DISPATCH]: bad file_sync_response: {decode_error}"),
        },
        MessageType::FileSyncStatus => match envelope.payload_as::<FileSyncStatusPayload>() {
            Ok(status) => on_file_sync_status(state, agent_id, status).await,
            Err(decode_error) => warn!("[DISPATCH]: bad file_sync_status: {decode_error}"),
        },
        MessageType::CurrentTaskStatus => match envelope.payload_as::<CurrentTaskStatusPayload>() {
            Ok(status) => task_service::reconcile_agent_state(state, agent_id, &status).await,
            Err(decode_error) => warn!("[DISPATCH]: bad current_task_status: {decode_error}"),
        },
        MessageType::StateSyncResponse => match envelope.payload_as() {
            Ok(response) => on_state_sync_response(state, agent_id, response).await,
            Err(decode_error) => warn!("[DISPATCH]: bad state_sync_response: {decode_error}"),
        },
        MessageType::PendingOutfiles => match envelope.payload_as::<PendingOutfilesPayload>() {
            Ok(pending) => cracks::handle_pending_outfiles(state, agent_id, pending).await,
            Err(decode_error) => warn!("[DISPATCH]: bad pending_outfiles: {decode_error}"),
        },
        MessageType::OutfileDeleteRejected => {
            match envelope.payload_as::<OutfileDeleteRejectedPayload>() {
                Ok(rejection) => cracks::handle_delete_rejected(state, agent_id, rejection).await,
                Err(decode_error) => warn!("[DISPATCH]: bad outfile_delete_rejected: {decode_error}"),
            }
        }
        MessageType::BufferedMessages => match envelope.payload_as::<BufferedMessagesPayload>() {
            Ok(replay) => on_buffered_messages(state, agent_id, replay).await,
            Err(decode_error) => warn!("[DISPATCH]: bad buffered_messages: {decode_error}"),
        },
        MessageType::TaskStopAck => {
            debug!("[DISPATCH]: stop acknowledged by agent {agent_id}");
        }
        MessageType::AgentShutdown => {
            info!("[DISPATCH]: agent {agent_id} announced shutdown");
        }
        MessageType::LogEntry | MessageType::DebugOutput => {
            debug!("[DISPATCH]: agent {agent_id} log: {:?}", envelope.payload);
        }
        other => {
            // Closed tag set: anything unexpected from an agent is ignored,
            // never fatal.
            warn!("[DISPATCH]: unexpected tag {} from agent {agent_id}", other.as_str());
        }
    }
}

async fn on_hardware_info(state: &AppState, agent_id: i64, envelope: Envelope) {
    let info: HardwareInfoPayload = match envelope.payload_as() {
        Ok(info) => info,
        Err(decode_error) => {
            warn!("[DISPATCH]: bad hardware_info: {decode_error}");
            return;
        }
    };
    let agents = AgentRepository::new(state.db.clone());
    if let Err(db_error) = agents.update_devices(agent_id, &info.devices).await {
        error!("[DISPATCH]: device update failed: {db_error}");
    }
}

/// Inventory report: record it, then answer with the sync command for
/// whatever is stale. An empty command completes the sync immediately.
async fn on_file_sync_response(
    state: &AppState,
    agent_id: i64,
    inventory: FileSyncResponsePayload,
) {
    let files = FileRepository::new(state.db.clone());
    let agents = AgentRepository::new(state.db.clone());

    if let Err(db_error) = files.replace_agent_inventory(agent_id, &inventory.files).await {
        error!("[DISPATCH]: inventory write failed: {db_error}");
        return;
    }

    let wanted: Vec<_> = match files.list(None).await {
        Ok(all) => all.into_iter().map(|file| file.info).collect(),
        Err(db_error) => {
            error!("[DISPATCH]: file listing failed: {db_error}");
            return;
        }
    };
    let stale = match files.out_of_sync_files(agent_id, &wanted).await {
        Ok(stale) => stale,
        Err(db_error) => {
            error!("[DISPATCH]: sync diff failed: {db_error}");
            return;
        }
    };

    if stale.is_empty() {
        if let Err(db_error) = agents.set_sync_status(agent_id, SyncStatus::Completed).await {
            error!("[DISPATCH]: sync status write failed: {db_error}");
        }
        info!("[DISPATCH]: agent {agent_id} inventory already current");
        return;
    }

    if let Err(db_error) = agents.set_sync_status(agent_id, SyncStatus::InProgress).await {
        error!("[DISPATCH]: sync status write failed: {db_error}");
    }
    let command = FileSyncCommandPayload { files: stale };
    match Envelope::new(MessageType::FileSyncCommand, &command) {
        Ok(envelope) => {
            if let Err(send_error) = state.connections.send(agent_id, envelope).await {
                warn!("[DISPATCH]: sync command send failed: {send_error}");
            }
        }
        Err(encode_error) => error!("[DISPATCH]: sync command encode failed: {encode_error}"),
    }
}

async fn on_file_sync_status(state: &AppState, agent_id: i64, status: FileSyncStatusPayload) {
    let agents = AgentRepository::new(state.db.clone());
    let new_status = if status.completed { SyncStatus::Completed } else { SyncStatus::Failed };
    if let Err(db_error) = agents.set_sync_status(agent_id, new_status).await {
        error!("[DISPATCH]: sync status write failed: {db_error}");
    }
    if !status.completed {
        warn!(
            "[DISPATCH]: agent {agent_id} sync failed: {}",
            status.message.unwrap_or_default()
        );
    }
}

async fn on_state_sync_response(
    state: &AppState,
    agent_id: i64,
    response: krakenhashes_models::messages::StateSyncResponsePayload,
) {
    // The response reconciles exactly like current_task_status, plus the
    // agent's pending completions get their idempotent ACKs re-driven.
    let as_status = CurrentTaskStatusPayload {
        has_running_task: response.has_running_task,
        task_id: response.task_id,
        job_id: response.job_id,
        status: response.status.clone(),
    };
    task_service::reconcile_agent_state(state, agent_id, &as_status).await;

    let tasks = TaskRepository::new(state.db.clone());
    for task_id in response.pending_completions {
        match tasks.try_get(task_id).await {
            Ok(Some(task)) => task_service::complete_task(state, &task, agent_id).await,
            Ok(None) => {
                // Task vanished with its job; still ACK so the agent stops
                // waiting.
                task_service::send_task_complete_ack(state, agent_id, task_id).await;
            }
            Err(db_error) => error!("[DISPATCH]: pending completion lookup failed: {db_error}"),
        }
    }
}

/// Replays preserved messages through the normal dispatch, then
/// acknowledges their ids so the agent prunes its buffer.
async fn on_buffered_messages(state: &AppState, agent_id: i64, replay: BufferedMessagesPayload) {
    info!(
        "[DISPATCH]: agent {agent_id} replaying {} buffered messages",
        replay.messages.len()
    );
    let mut acknowledged = Vec::with_capacity(replay.messages.len());
    for entry in replay.messages {
        let envelope = Envelope {
            message_type: entry.message_type,
            payload: entry.payload,
            timestamp: entry.created_at,
        };
        Box::pin(handle(state, agent_id, envelope)).await;
        acknowledged.push(entry.message_id);
    }

    let ack = BufferAckPayload { message_ids: acknowledged };
    match Envelope::new(MessageType::BufferAck, &ack) {
        Ok(envelope) => {
            if let Err(send_error) = state.connections.send(agent_id, envelope).await {
                warn!("[DISPATCH]: buffer_ack send failed: {send_error}");
            }
        }
        Err(encode_error) => error!("[DISPATCH]: buffer_ack encode failed: {encode_error}"),
    }
}
