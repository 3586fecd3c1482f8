// [libs/domain/models/src/job.rs]
//! Job executions and increment-mode layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hashcat attack modes the control plane schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AttackMode {
    Straight,
    Combination,
    BruteForce,
    HybridWordlistMask,
    HybridMaskWordlist,
    Association,
}

impl AttackMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            AttackMode::Straight => 0,
            AttackMode::Combination => 1,
            AttackMode::BruteForce => 3,
            AttackMode::HybridWordlistMask => 6,
            AttackMode::HybridMaskWordlist => 7,
            AttackMode::Association => 9,
        }
    }
}

impl TryFrom<u8> for AttackMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AttackMode::Straight),
            1 => Ok(AttackMode::Combination),
            3 => Ok(AttackMode::BruteForce),
            6 => Ok(AttackMode::HybridWordlistMask),
            7 => Ok(AttackMode::HybridMaskWordlist),
            9 => Ok(AttackMode::Association),
            other => Err(format!("unknown attack mode {other}")),
        }
    }
}

impl From<AttackMode> for u8 {
    fn from(mode: AttackMode) -> u8 {
        mode.as_u8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementMode {
    Off,
    Increment,
    IncrementInverse,
}

impl IncrementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementMode::Off => "off",
            IncrementMode::Increment => "increment",
            IncrementMode::IncrementInverse => "increment_inverse",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "off" => Some(IncrementMode::Off),
            "increment" => Some(IncrementMode::Increment),
            "increment_inverse" => Some(IncrementMode::IncrementInverse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One scheduled cracking job against a hashlist.
///
/// Keyspace accounting invariant:
/// `processed_keyspace <= dispatched_keyspace <= effective_keyspace`, where
/// the effective value may be refined upward as tasks report actuals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub hashlist_id: Uuid,
    pub attack_mode: AttackMode,
    pub hash_type: u32,
    pub mask: Option<String>,
    pub wordlist_ids: Vec<i64>,
    pub rule_ids: Vec<i64>,
    /// Association wordlist for attack mode 9; requires 1:1 line
    /// correspondence with the original hashlist file.
    pub assoc_wordlist_id: Option<i64>,
    pub priority: i32,
    pub max_agents: u32,
    pub binary_pattern: String,
    pub status: JobStatus,
    /// `hashcat --keyspace` for the mask/wordlist, rules ignored.
    pub base_keyspace: Option<u64>,
    /// True candidate×rule count; hashcat's `progress[1]`.
    pub effective_keyspace: Option<u64>,
    /// Rule count, 1 when no rules.
    pub multiplication_factor: u64,
    pub is_accurate_keyspace: bool,
    pub uses_rule_splitting: bool,
    pub rule_split_count: u32,
    pub avg_rule_multiplier: Option<f64>,
    pub increment_mode: IncrementMode,
    pub increment_min: Option<u32>,
    pub increment_max: Option<u32>,
    pub dispatched_keyspace: u64,
    pub processed_keyspace: u64,
    pub completion_email_sent: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    /// Work not yet handed to any agent, in effective-keyspace units.
    pub fn remaining_keyspace(&self) -> u64 {
        self.effective_keyspace
            .unwrap_or(0)
            .saturating_sub(self.dispatched_keyspace)
    }

    pub fn is_work_exhausted(&self) -> bool {
        self.is_accurate_keyspace && self.remaining_keyspace() == 0
    }
}

/// A per-mask-length sub-job created when increment mode is on. Owns its own
/// keyspace counters; the parent job's totals are the layer sums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementLayer {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Mask length this layer covers.
    pub mask_length: u32,
    /// Mask truncated or expanded to this layer's length.
    pub layer_mask: String,
    pub status: JobStatus,
    pub base_keyspace: Option<u64>,
    pub effective_keyspace: Option<u64>,
    pub is_accurate_keyspace: bool,
    pub dispatched_keyspace: u64,
    pub processed_keyspace: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl IncrementLayer {
    pub fn remaining_keyspace(&self) -> u64 {
        self.effective_keyspace
            .unwrap_or(0)
            .saturating_sub(self.dispatched_keyspace)
    }
}
