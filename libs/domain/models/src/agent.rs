// [libs/domain/models/src/agent.rs]
//! Agent and device records as the registry tracks them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File-sync progress for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SyncStatus::Pending),
            "in_progress" => Some(SyncStatus::InProgress),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Connection status the registry reports for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// One compute unit on an agent. The enabled set is the device filter passed
/// to the cracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: u32,
    pub enabled: bool,
    /// Device class as the cracker reports it, e.g. "GPU" or "CPU".
    pub device_type: String,
    pub name: String,
}

/// A registered remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    /// Binary-version pattern this agent satisfies (see `binary_pattern`).
    pub binary_pattern: String,
    pub enabled: bool,
    /// True while exactly one task in {assigned, running, processing}
    /// references this agent.
    pub busy: bool,
    pub current_task_id: Option<Uuid>,
    pub current_job_id: Option<Uuid>,
    /// Extra command-line parameters appended to every cracker invocation.
    pub extra_parameters: String,
    pub devices: Vec<Device>,
    pub sync_status: SyncStatus,
    pub status: AgentStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Free-form metadata mutated only by the scheduler and session layer.
    pub metadata: serde_json::Value,
}

impl Agent {
    /// Device ids the cracker may use, in reporting order.
    pub fn enabled_device_ids(&self) -> Vec<u32> {
        self.devices
            .iter()
            .filter(|device| device.enabled)
            .map(|device| device.device_id)
            .collect()
    }
}
