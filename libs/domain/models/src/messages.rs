// [libs/domain/models/src/messages.rs]
//! The wire protocol: a closed tag set plus typed payloads inside one JSON
//! envelope.
//!
//! Unknown tags are a protocol error the session layer logs and ignores;
//! they never close the connection. Payloads stay opaque (`serde_json::Value`)
//! inside the envelope so the routing layer can forward without decoding.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::Device;
use crate::file::{AgentFileEntry, FileInfo};
use crate::job::IncrementMode;

/// Hard cap on one physical message.
pub const MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;
/// Cap on the small-message fast path (everything except crack batches and
/// file-sync inventories).
pub const SMALL_MESSAGE_BYTES: usize = 512 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message tag: {0}")]
    UnknownTag(String),
    #[error("payload does not match tag {tag}: {source}")]
    PayloadMismatch {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Closed set of message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    HardwareInfo,
    Heartbeat,
    AgentStatus,
    TaskAssignment,
    JobProgress,
    JobStatus,
    CrackBatch,
    CrackBatchesComplete,
    JobStop,
    BenchmarkRequest,
    BenchmarkResult,
    FileSyncRequest,
    FileSyncResponse,
    FileSyncCommand,
    FileSyncStatus,
    CurrentTaskStatus,
    TaskCompleteAck,
    TaskStopAck,
    StateSyncRequest,
    StateSyncResponse,
    PendingOutfiles,
    RequestCrackRetransmit,
    OutfileDeleteApproved,
    OutfileDeleteRejected,
    BufferedMessages,
    BufferAck,
    AgentShutdown,
    DebugCommand,
    DebugOutput,
    LogEntry,
    LogLevelChange,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::HardwareInfo => "hardware_info",
            MessageType::Heartbeat => "heartbeat",
            MessageType::AgentStatus => "agent_status",
            MessageType::TaskAssignment => "task_assignment",
            MessageType::JobProgress => "job_progress",
            MessageType::JobStatus => "job_status",
            MessageType::CrackBatch => "crack_batch",
            MessageType::CrackBatchesComplete => "crack_batches_complete",
            MessageType::JobStop => "job_stop",
            MessageType::BenchmarkRequest => "benchmark_request",
            MessageType::BenchmarkResult => "benchmark_result",
            MessageType::FileSyncRequest => "file_sync_request",
            MessageType::FileSyncResponse => "file_sync_response",
            MessageType::FileSyncCommand => "file_sync_command",
            MessageType::FileSyncStatus => "file_sync_status",
            MessageType::CurrentTaskStatus => "current_task_status",
            MessageType::TaskCompleteAck => "task_complete_ack",
            MessageType::TaskStopAck => "task_stop_ack",
            MessageType::StateSyncRequest => "state_sync_request",
            MessageType::StateSyncResponse => "state_sync_response",
            MessageType::PendingOutfiles => "pending_outfiles",
            MessageType::RequestCrackRetransmit => "request_crack_retransmit",
            MessageType::OutfileDeleteApproved => "outfile_delete_approved",
            MessageType::OutfileDeleteRejected => "outfile_delete_rejected",
            MessageType::BufferedMessages => "buffered_messages",
            MessageType::BufferAck => "buffer_ack",
            MessageType::AgentShutdown => "agent_shutdown",
            MessageType::DebugCommand => "debug_command",
            MessageType::DebugOutput => "debug_output",
            MessageType::LogEntry => "log_entry",
            MessageType::LogLevelChange => "log_level_change",
        }
    }

    /// Tags the sender may drop with a warning when the outbound queue is
    /// saturated. Everything else is must-deliver and surfaces a send
    /// failure after the configured timeout.
    pub fn is_drop_safe(&self) -> bool {
        matches!(
            self,
            MessageType::JobProgress
                | MessageType::AgentStatus
                | MessageType::HardwareInfo
                | MessageType::Heartbeat
                | MessageType::LogEntry
                | MessageType::DebugOutput
                | MessageType::FileSyncStatus
        )
    }

    /// Tags the agent preserves on disk while disconnected. Progress-class
    /// messages are additionally filtered by `carries_crack_information`.
    pub fn is_buffer_candidate(&self) -> bool {
        matches!(
            self,
            MessageType::JobProgress
                | MessageType::JobStatus
                | MessageType::CrackBatch
                | MessageType::CrackBatchesComplete
                | MessageType::BenchmarkResult
        )
    }
}

impl std::str::FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(raw.to_string()))
            .map_err(|_| ProtocolError::UnknownTag(raw.to_string()))
    }
}

/// The framed unit on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_type,
            payload: serde_json::to_value(payload)?,
            timestamp: Utc::now(),
        })
    }

    /// Decodes the payload into the struct the tag demands.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| {
            ProtocolError::PayloadMismatch {
                tag: self.message_type.as_str(),
                source,
            }
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Whether this envelope is worth preserving across a disconnect: crack
    /// data always, progress-class messages only when they carry crack
    /// information.
    pub fn carries_crack_information(&self) -> bool {
        match self.message_type {
            MessageType::CrackBatch | MessageType::CrackBatchesComplete => true,
            MessageType::BenchmarkResult => true,
            MessageType::JobProgress | MessageType::JobStatus => self
                .payload
                .get("cracked_count")
                .and_then(|value| value.as_u64())
                .map(|count| count > 0)
                .unwrap_or(false)
                || self
                    .payload
                    .get("all_hashes_cracked")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfoPayload {
    pub devices: Vec<Device>,
    pub os_info: String,
    pub agent_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusPayload {
    pub status: String,
    pub active_task_id: Option<Uuid>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentPayload {
    pub task_id: Uuid,
    pub job_execution_id: Uuid,
    pub hashlist_id: Uuid,
    pub hashlist_path: String,
    pub attack_mode: u8,
    pub hash_type: u32,
    pub keyspace_start: u64,
    pub keyspace_end: u64,
    pub wordlist_paths: Vec<String>,
    pub rule_paths: Vec<String>,
    pub mask: Option<String>,
    pub binary_path: String,
    pub chunk_duration: u64,
    pub report_interval: u64,
    /// Always "3": `hash:plain` outfile lines.
    pub output_format: String,
    pub extra_parameters: String,
    pub enabled_devices: Option<Vec<u32>>,
    pub is_keyspace_split: bool,
    /// Set only for whole-job increment runs; layer tasks omit it along with
    /// the min/max bounds so the agent never passes `--increment*`.
    pub increment_mode: Option<IncrementMode>,
    pub increment_min: Option<u32>,
    pub increment_max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressPayload {
    pub task_id: Uuid,
    pub keyspace_processed: u64,
    pub effective_progress: u64,
    pub progress_percent: f64,
    pub hash_rate: u64,
    pub cracked_count: u64,
    pub all_hashes_cracked: bool,
    pub status: String,
    pub error_message: Option<String>,
    /// `progress[1]` for the invocation; feeds keyspace calibration.
    pub total_effective_keyspace: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusPayload {
    pub task_id: Uuid,
    /// "completed" | "failed" | "stopped".
    pub status: String,
    pub cracked_count: u64,
    pub keyspace_processed: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrackedHash {
    pub hash: String,
    pub plain: String,
    pub crack_pos: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackBatchPayload {
    pub task_id: Uuid,
    pub is_retransmit: bool,
    pub cracked_hashes: Vec<CrackedHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrackBatchesCompletePayload {
    pub task_id: Uuid,
    pub is_retransmit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStopPayload {
    pub task_id: Uuid,
    pub stop_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStopAckPayload {
    pub stop_id: Uuid,
    pub task_id: Uuid,
    pub stopped: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRequestPayload {
    pub request_id: Uuid,
    pub attack_mode: u8,
    pub hash_type: u32,
    pub salt_count: Option<u64>,
    /// Job whose keyspace this benchmark also calibrates, when forced.
    pub job_execution_id: Option<Uuid>,
    pub layer_id: Option<Uuid>,
    pub forced: bool,
    pub hashlist_path: String,
    pub mask: Option<String>,
    pub wordlist_paths: Vec<String>,
    pub rule_paths: Vec<String>,
    pub binary_path: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResultPayload {
    pub request_id: Uuid,
    pub attack_mode: u8,
    pub hash_type: u32,
    pub salt_count: Option<u64>,
    pub speed: u64,
    /// Captured `progress[1]`; present only on forced runs.
    pub total_keyspace: Option<u64>,
    pub forced: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncRequestPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncResponsePayload {
    pub files: Vec<AgentFileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncCommandPayload {
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSyncStatusPayload {
    pub completed: bool,
    pub downloaded: u32,
    pub failed: u32,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTaskStatusPayload {
    pub has_running_task: bool,
    pub task_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    /// "idle" | "running" | "completing".
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteAckPayload {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncRequestPayload {
    pub request_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncResponsePayload {
    pub request_id: Uuid,
    pub has_running_task: bool,
    pub task_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    /// "idle" | "running" | "completing".
    pub status: String,
    /// Tasks whose completion the agent is still waiting to have ACKed.
    pub pending_completions: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOutfilesPayload {
    pub task_ids: Vec<Uuid>,
    pub current_task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCrackRetransmitPayload {
    pub task_id: Uuid,
    pub expected_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutfileDeleteApprovedPayload {
    pub task_id: Uuid,
    pub expected_line_count: u64,
    /// False for orphans of deleted jobs; the agent then deletes
    /// unconditionally.
    pub task_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutfileDeleteRejectedPayload {
    pub task_id: Uuid,
    pub expected_line_count: u64,
    pub actual_line_count: u64,
    pub reason: String,
}

/// One preserved message replayed after a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEntry {
    pub message_id: String,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessagesPayload {
    pub messages: Vec<BufferedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferAckPayload {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentShutdownPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugCommandPayload {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugOutputPayload {
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryPayload {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLevelChangePayload {
    pub level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_round_trip_through_serde() {
        let tags = [
            MessageType::HardwareInfo,
            MessageType::CrackBatchesComplete,
            MessageType::RequestCrackRetransmit,
            MessageType::OutfileDeleteApproved,
            MessageType::StateSyncResponse,
        ];
        for tag in tags {
            let json = serde_json::to_string(&tag).unwrap();
            assert_eq!(json, format!("\"{}\"", tag.as_str()));
            let back: MessageType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, tag);
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let raw = r#"{"type":"warp_drive","payload":{},"timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(Envelope::decode(raw).is_err());
        assert!("warp_drive".parse::<MessageType>().is_err());
    }

    #[test]
    fn envelope_payload_round_trip() {
        let payload = RequestCrackRetransmitPayload {
            task_id: Uuid::new_v4(),
            expected_count: 3,
        };
        let envelope = Envelope::new(MessageType::RequestCrackRetransmit, &payload).unwrap();
        let wire = envelope.encode().unwrap();
        let decoded = Envelope::decode(&wire).unwrap();
        let back: RequestCrackRetransmitPayload = decoded.payload_as().unwrap();
        assert_eq!(back.task_id, payload.task_id);
        assert_eq!(back.expected_count, 3);
    }

    #[test]
    fn payload_mismatch_is_reported_per_message() {
        let envelope = Envelope::new(
            MessageType::BufferAck,
            &BufferAckPayload { message_ids: vec!["a".into()] },
        )
        .unwrap();
        let mismatch: Result<TaskAssignmentPayload, _> = envelope.payload_as();
        assert!(mismatch.is_err());
    }

    #[test]
    fn crack_information_filter() {
        let quiet_progress = Envelope::new(
            MessageType::JobProgress,
            &serde_json::json!({"task_id": Uuid::nil(), "cracked_count": 0}),
        )
        .unwrap();
        assert!(!quiet_progress.carries_crack_information());

        let cracking_progress = Envelope::new(
            MessageType::JobProgress,
            &serde_json::json!({"task_id": Uuid::nil(), "cracked_count": 2}),
        )
        .unwrap();
        assert!(cracking_progress.carries_crack_information());

        let final_progress = Envelope::new(
            MessageType::JobProgress,
            &serde_json::json!({"task_id": Uuid::nil(), "cracked_count": 0, "all_hashes_cracked": true}),
        )
        .unwrap();
        assert!(final_progress.carries_crack_information());

        let batch = Envelope::new(
            MessageType::CrackBatch,
            &CrackBatchPayload { task_id: Uuid::nil(), is_retransmit: false, cracked_hashes: vec![] },
        )
        .unwrap();
        assert!(batch.carries_crack_information());

        let heartbeat = Envelope::new(MessageType::Heartbeat, &serde_json::json!({})).unwrap();
        assert!(!heartbeat.carries_crack_information());
    }

    #[test]
    fn drop_safety_classification() {
        assert!(MessageType::JobProgress.is_drop_safe());
        assert!(MessageType::LogEntry.is_drop_safe());
        assert!(!MessageType::TaskAssignment.is_drop_safe());
        assert!(!MessageType::JobStop.is_drop_safe());
        assert!(!MessageType::TaskCompleteAck.is_drop_safe());
        assert!(!MessageType::CrackBatch.is_drop_safe());
    }
}
