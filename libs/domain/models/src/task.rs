// [libs/domain/models/src/task.rs]
//! Job tasks (chunks) and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chunk lifecycle: `pending → assigned → running → processing →
/// completed | failed`, with `reconnect_pending` parked during an agent
/// disconnect and `processing_error` terminal after retransmit exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Processing,
    Completed,
    Failed,
    ReconnectPending,
    ProcessingError,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::ReconnectPending => "reconnect_pending",
            TaskStatus::ProcessingError => "processing_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "running" => Some(TaskStatus::Running),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "reconnect_pending" => Some(TaskStatus::ReconnectPending),
            "processing_error" => Some(TaskStatus::ProcessingError),
            _ => None,
        }
    }

    /// States that keep an agent's busy flag held.
    pub fn occupies_agent(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Processing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::ProcessingError
        )
    }
}

/// One dispatched chunk of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub layer_id: Option<Uuid>,
    pub agent_id: Option<i64>,
    pub status: TaskStatus,
    /// Candidate range in base-keyspace units (`--skip` / `--limit`).
    pub keyspace_start: u64,
    pub keyspace_end: u64,
    /// Range in effective-keyspace units, once known.
    pub effective_keyspace_start: Option<u64>,
    pub effective_keyspace_end: Option<u64>,
    /// `progress[1]` the agent reported for this chunk alone.
    pub chunk_actual_keyspace: Option<u64>,
    pub is_keyspace_split: bool,
    pub is_rule_split: bool,
    pub rule_chunk_path: Option<String>,
    pub rule_start_index: Option<u32>,
    pub rule_end_index: Option<u32>,
    /// Cracks the agent said it found; the completion gate compares the
    /// database row count against this.
    pub expected_crack_count: u64,
    /// Diagnostic counter incremented by nominal batch sizes; can overcount
    /// and never gates completion.
    pub received_crack_count: u64,
    pub batches_complete_signaled: bool,
    pub retry_count: u32,
    pub retransmit_count: u32,
    pub detailed_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobTask {
    /// Effective-keyspace width of this chunk, preferring the reported
    /// actual over the planned range.
    pub fn effective_width(&self) -> u64 {
        if let Some(actual) = self.chunk_actual_keyspace {
            return actual;
        }
        match (self.effective_keyspace_start, self.effective_keyspace_end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => self.keyspace_end.saturating_sub(self.keyspace_start),
        }
    }
}
