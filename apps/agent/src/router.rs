// [apps/agent/src/router.rs]
//! Inbound message routing. The read loop calls `route` and nothing else:
//! every handler that can block forks onto its own task so heartbeats stay
//! responsive through minute-long downloads and cracker runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_models::messages::{
    BenchmarkRequestPayload, BufferAckPayload, CurrentTaskStatusPayload, DebugCommandPayload,
    DebugOutputPayload, Envelope, FileSyncCommandPayload, FileSyncResponsePayload,
    JobStatusPayload, JobStopPayload, MessageType, OutfileDeleteApprovedPayload,
    RequestCrackRetransmitPayload, StateSyncRequestPayload, StateSyncResponsePayload,
    TaskAssignmentPayload, TaskCompleteAckPayload, TaskStopAckPayload,
};
use krakenhashes_models::AttackMode;
use krakenhashes_server_client::ServerClient;

use crate::executor::{RunOutcome, TaskRunner};
use crate::outfile::{handle_delete_approval, retransmit_outfile, OutfileStreamer};
use crate::state::{TaskBoard, TaskPhase};
use crate::sync::FileSyncManager;
use crate::uplink::Uplink;

/// Completion-ACK wait: retries before falling back to reconnect re-announce.
const ACK_WAIT_ATTEMPTS: u32 = 6;
const ACK_WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// Everything a handler may need; cheap to clone per spawned task.
#[derive(Clone)]
pub struct AgentRuntime {
    pub uplink: Arc<Uplink>,
    pub board: Arc<TaskBoard>,
    pub sync: Arc<FileSyncManager>,
    pub runner: Arc<TaskRunner>,
    pub server: Arc<ServerClient>,
    pub buffer: Arc<crate::buffer::DiskBuffer>,
    pub data_dir: PathBuf,
    pub debug: bool,
}

impl AgentRuntime {
    /// Constant-time dispatch; long work is forked.
    #[instrument(skip(self, envelope), fields(tag = envelope.message_type.as_str()))]
    pub fn route(&self, envelope: Envelope) {
        match envelope.message_type {
            MessageType::TaskAssignment => self.on_task_assignment(envelope),
            MessageType::JobStop => self.on_job_stop(envelope),
            MessageType::BenchmarkRequest => self.on_benchmark_request(envelope),
            MessageType::FileSyncRequest => self.on_file_sync_request(),
            MessageType::FileSyncCommand => self.on_file_sync_command(envelope),
            MessageType::StateSyncRequest => self.on_state_sync_request(envelope),
            MessageType::TaskCompleteAck => self.on_task_complete_ack(envelope),
            MessageType::RequestCrackRetransmit => self.on_retransmit_request(envelope),
            MessageType::OutfileDeleteApproved => self.on_delete_approved(envelope),
            MessageType::BufferAck => self.on_buffer_ack(envelope),
            MessageType::LogLevelChange => {
                info!("[ROUTER]: log level change requested: {:?}", envelope.payload);
            }
            MessageType::DebugCommand => self.on_debug_command(envelope),
            MessageType::Heartbeat => {}
            other => {
                // Protocol tolerance: a message we did not expect from the
                // server is logged and dropped, never fatal.
                debug!("[ROUTER]: ignoring unexpected tag {}", other.as_str());
            }
        }
    }

    fn on_task_assignment(&self, envelope: Envelope) {
        let assignment: TaskAssignmentPayload = match envelope.payload_as() {
            Ok(assignment) => assignment,
            Err(decode_error) => {
                warn!("[ROUTER]: bad task_assignment payload: {decode_error}");
                return;
            }
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.execute_assignment(assignment).await;
        });
    }

    async fn execute_assignment(&self, assignment: TaskAssignmentPayload) {
        let task_id = assignment.task_id;
        let stop_receiver = match self.board.start_task(task_id, assignment.job_execution_id) {
            Ok(receiver) => receiver,
            Err(active) => {
                warn!("[ROUTER]: assignment {task_id} refused, task {active} is active");
                return;
            }
        };
        info!("[ROUTER]: task {task_id} accepted");

        // Hashlists are always re-fetched before work: the server may have
        // regenerated the file since our last sync.
        let association = assignment.attack_mode == AttackMode::Association.as_u8();
        let hashlist_destination = self.data_dir.join(&assignment.hashlist_path);
        if let Err(download_error) = self
            .server
            .download_hashlist(assignment.hashlist_id, association, &hashlist_destination)
            .await
        {
            error!("[ROUTER]: hashlist refresh failed for {task_id}: {download_error}");
            self.report_job_status(task_id, "failed", 0, 0, Some(download_error.to_string())).await;
            self.board.finish_task(task_id, false);
            return;
        }

        // Rule chunks are server-materialized per task; fetch any the
        // assignment references before the cracker needs them.
        for rule_path in &assignment.rule_paths {
            let Some(relative) = rule_path.strip_prefix("rules/chunks/") else { continue };
            let Some((job_dir, chunk_name)) = relative.split_once('/') else { continue };
            let destination = self.data_dir.join(rule_path);
            if let Err(download_error) =
                self.server.download_rule_chunk(job_dir, chunk_name, &destination).await
            {
                error!("[ROUTER]: rule chunk fetch failed for {task_id}: {download_error}");
                self.report_job_status(task_id, "failed", 0, 0, Some(download_error.to_string()))
                    .await;
                self.board.finish_task(task_id, false);
                return;
            }
        }

        // The outfile streamer runs beside the cracker and drains the tail
        // after it exits.
        let (done_sender, done_receiver) = watch::channel(false);
        let streamer = OutfileStreamer::new(task_id, &self.data_dir, Arc::clone(&self.uplink));
        let streamer_handle = tokio::spawn(async move { streamer.run(done_receiver).await });

        let outcome = self.runner.run(&assignment, stop_receiver).await;
        self.board.mark_completing(task_id);
        let _ = done_sender.send(true);

        match outcome {
            RunOutcome::Completed {
                cracked_count,
                keyspace_processed,
                all_hashes_cracked,
                ..
            } => {
                if all_hashes_cracked {
                    info!("[ROUTER]: task {task_id} reports every hash cracked");
                }
                self.report_job_status(task_id, "completed", cracked_count, keyspace_processed, None)
                    .await;
                let _ = streamer_handle.await;
                self.board.finish_task(task_id, true);
                self.wait_for_completion_ack(task_id);
            }
            RunOutcome::Stopped => {
                // The stop ACK went out when the stop arrived; just clean up.
                let _ = streamer_handle.await;
                self.board.finish_task(task_id, false);
                info!("[ROUTER]: task {task_id} stopped");
            }
            RunOutcome::Failed(reason) => {
                error!("[ROUTER]: task {task_id} failed: {reason}");
                self.report_job_status(task_id, "failed", 0, 0, Some(reason)).await;
                let _ = streamer_handle.await;
                self.board.finish_task(task_id, false);
            }
        }
    }

    async fn report_job_status(
        &self,
        task_id: Uuid,
        status: &str,
        cracked_count: u64,
        keyspace_processed: u64,
        error_message: Option<String>,
    ) {
        let payload = JobStatusPayload {
            task_id,
            status: status.to_string(),
            cracked_count,
            keyspace_processed,
            error_message,
        };
        match Envelope::new(MessageType::JobStatus, &payload) {
            Ok(envelope) => {
                if let Err(send_error) = self.uplink.send(envelope).await {
                    warn!("[ROUTER]: job_status send failed (buffered): {send_error}");
                }
            }
            Err(encode_error) => error!("[ROUTER]: job_status encode failed: {encode_error}"),
        }
    }

    /// Waits for the server's completion ACK; after exhaustion the task id
    /// stays in the pending set and is re-announced on the next connect.
    fn wait_for_completion_ack(&self, task_id: Uuid) {
        let board = Arc::clone(&self.board);
        tokio::spawn(async move {
            for _ in 0..ACK_WAIT_ATTEMPTS {
                tokio::time::sleep(ACK_WAIT_INTERVAL).await;
                if !board.pending_completions().contains(&task_id) {
                    return;
                }
            }
            warn!("[ROUTER]: completion ACK for {task_id} still pending, will re-announce on reconnect");
        });
    }

    fn on_job_stop(&self, envelope: Envelope) {
        let stop: JobStopPayload = match envelope.payload_as() {
            Ok(stop) => stop,
            Err(decode_error) => {
                warn!("[ROUTER]: bad job_stop payload: {decode_error}");
                return;
            }
        };
        let stopped = self.board.request_stop(stop.task_id);
        let ack = TaskStopAckPayload {
            stop_id: stop.stop_id,
            task_id: stop.task_id,
            stopped,
            message: (!stopped).then(|| "task not active on this agent".to_string()),
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            if let Ok(envelope) = Envelope::new(MessageType::TaskStopAck, &ack) {
                if let Err(send_error) = runtime.uplink.send(envelope).await {
                    warn!("[ROUTER]: task_stop_ack send failed: {send_error}");
                }
            }
        });
    }

    fn on_benchmark_request(&self, envelope: Envelope) {
        let request: BenchmarkRequestPayload = match envelope.payload_as() {
            Ok(request) => request,
            Err(decode_error) => {
                warn!("[ROUTER]: bad benchmark_request payload: {decode_error}");
                return;
            }
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            // Benchmarks also run against a fresh hashlist.
            let destination = runtime.data_dir.join(&request.hashlist_path);
            if let Err(download_error) = runtime
                .server
                .download_hashlist(extract_hashlist_id(&request.hashlist_path), false, &destination)
                .await
            {
                warn!("[ROUTER]: benchmark hashlist refresh failed: {download_error}");
            }
            let result = runtime.runner.run_benchmark(&request).await;
            if let Ok(envelope) = Envelope::new(MessageType::BenchmarkResult, &result) {
                if let Err(send_error) = runtime.uplink.send(envelope).await {
                    warn!("[ROUTER]: benchmark_result send failed (buffered): {send_error}");
                }
            }
        });
    }

    fn on_file_sync_request(&self) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let files = runtime.sync.scan_inventory().await;
            let response = FileSyncResponsePayload { files };
            if let Ok(envelope) = Envelope::new(MessageType::FileSyncResponse, &response) {
                if let Err(send_error) = runtime.uplink.send(envelope).await {
                    warn!("[ROUTER]: file_sync_response send failed: {send_error}");
                }
            }
        });
    }

    fn on_file_sync_command(&self, envelope: Envelope) {
        let command: FileSyncCommandPayload = match envelope.payload_as() {
            Ok(command) => command,
            Err(decode_error) => {
                warn!("[ROUTER]: bad file_sync_command payload: {decode_error}");
                return;
            }
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.sync.pre_sync_sweep().await;
            let status = runtime.sync.execute_sync(command.files).await;
            if let Ok(envelope) = Envelope::new(MessageType::FileSyncStatus, &status) {
                runtime.uplink.send_async(envelope);
            }
        });
    }

    /// Pure with respect to agent state: answering N times is safe.
    fn on_state_sync_request(&self, envelope: Envelope) {
        let request: StateSyncRequestPayload = match envelope.payload_as() {
            Ok(request) => request,
            Err(decode_error) => {
                warn!("[ROUTER]: bad state_sync_request payload: {decode_error}");
                return;
            }
        };
        let (active, phase) = self.board.snapshot();
        let response = StateSyncResponsePayload {
            request_id: request.request_id,
            has_running_task: active.is_some(),
            task_id: active.map(|(task_id, _)| task_id),
            job_id: active.map(|(_, job_id)| job_id),
            status: phase.as_str().to_string(),
            pending_completions: self.board.pending_completions(),
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            if let Ok(envelope) = Envelope::new(MessageType::StateSyncResponse, &response) {
                if let Err(send_error) = runtime.uplink.send(envelope).await {
                    warn!("[ROUTER]: state_sync_response send failed: {send_error}");
                }
            }
        });
    }

    fn on_task_complete_ack(&self, envelope: Envelope) {
        let ack: TaskCompleteAckPayload = match envelope.payload_as() {
            Ok(ack) => ack,
            Err(decode_error) => {
                warn!("[ROUTER]: bad task_complete_ack payload: {decode_error}");
                return;
            }
        };
        if self.board.acknowledge_completion(ack.task_id) {
            info!("[ROUTER]: completion of {} acknowledged", ack.task_id);
        } else {
            // Idempotent re-delivery; nothing to change.
            debug!("[ROUTER]: duplicate completion ACK for {}", ack.task_id);
        }
    }

    fn on_retransmit_request(&self, envelope: Envelope) {
        let request: RequestCrackRetransmitPayload = match envelope.payload_as() {
            Ok(request) => request,
            Err(decode_error) => {
                warn!("[ROUTER]: bad request_crack_retransmit payload: {decode_error}");
                return;
            }
        };
        info!(
            "[ROUTER]: retransmit requested for {} (server expects {})",
            request.task_id, request.expected_count
        );
        let runtime = self.clone();
        tokio::spawn(async move {
            retransmit_outfile(request.task_id, &runtime.data_dir, Arc::clone(&runtime.uplink)).await;
        });
    }

    fn on_delete_approved(&self, envelope: Envelope) {
        let approval: OutfileDeleteApprovedPayload = match envelope.payload_as() {
            Ok(approval) => approval,
            Err(decode_error) => {
                warn!("[ROUTER]: bad outfile_delete_approved payload: {decode_error}");
                return;
            }
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            handle_delete_approval(
                approval,
                &runtime.board,
                &runtime.data_dir,
                Arc::clone(&runtime.uplink),
            )
            .await;
        });
    }

    fn on_buffer_ack(&self, envelope: Envelope) {
        let ack: BufferAckPayload = match envelope.payload_as() {
            Ok(ack) => ack,
            Err(decode_error) => {
                warn!("[ROUTER]: bad buffer_ack payload: {decode_error}");
                return;
            }
        };
        // Only acknowledged ids leave the disk; the rest replay next time.
        self.buffer.prune(&ack.message_ids);
        debug!("[ROUTER]: {} buffered messages acknowledged", ack.message_ids.len());
    }

    fn on_debug_command(&self, envelope: Envelope) {
        if !self.debug {
            debug!("[ROUTER]: debug command ignored outside DEBUG mode");
            return;
        }
        let command: DebugCommandPayload = match envelope.payload_as() {
            Ok(command) => command,
            Err(decode_error) => {
                warn!("[ROUTER]: bad debug_command payload: {decode_error}");
                return;
            }
        };
        let output = DebugOutputPayload {
            output: format!("agent alive; unhandled debug command: {}", command.command),
        };
        if let Ok(envelope) = Envelope::new(MessageType::DebugOutput, &output) {
            self.uplink.send_async(envelope);
        }
    }

    /// Builds the reconciliation message sent right after connecting.
    pub fn current_task_status(&self) -> CurrentTaskStatusPayload {
        let (active, phase) = self.board.snapshot();
        CurrentTaskStatusPayload {
            has_running_task: active.is_some() && phase == TaskPhase::Running,
            task_id: active.map(|(task_id, _)| task_id),
            job_id: active.map(|(_, job_id)| job_id),
            status: phase.as_str().to_string(),
        }
    }
}

/// Hashlist paths look like `hashlists/{uuid}.hash`; benchmark requests
/// carry the path, not the id.
fn extract_hashlist_id(path: &str) -> Uuid {
    std::path::Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| Uuid::parse_str(stem).ok())
        .unwrap_or_else(Uuid::nil)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashlist_id_extraction() {
        let id = Uuid::new_v4();
        assert_eq!(extract_hashlist_id(&format!("hashlists/{id}.hash")), id);
        assert_eq!(extract_hashlist_id("hashlists/garbage.hash"), Uuid::nil());
    }
}
