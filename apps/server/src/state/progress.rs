// [apps/server/src/state/progress.rs]
//! In-memory progress snapshots feeding the periodic rollup, plus the set
//! of jobs pinned to 100% by an all-hashes-cracked signal.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TaskProgressSnapshot {
    pub job_id: Uuid,
    pub layer_id: Option<Uuid>,
    pub keyspace_processed: u64,
    pub effective_progress: u64,
    pub hash_rate: u64,
    pub cracked_count: u64,
    pub updated_at: Instant,
}

#[derive(Default)]
pub struct ProgressMap {
    snapshots: RwLock<HashMap<Uuid, TaskProgressSnapshot>>,
    /// Jobs whose displayed progress is clamped to 100%.
    fully_cracked_jobs: RwLock<HashSet<Uuid>>,
}

impl ProgressMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, task_id: Uuid, snapshot: TaskProgressSnapshot) {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshots.insert(task_id, snapshot);
    }

    pub fn forget_task(&self, task_id: Uuid) {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshots.remove(&task_id);
    }

    pub fn snapshots_for_job(&self, job_id: Uuid) -> Vec<(Uuid, TaskProgressSnapshot)> {
        let snapshots = self
            .snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshots
            .iter()
            .filter(|(_, snapshot)| snapshot.job_id == job_id)
            .map(|(task_id, snapshot)| (*task_id, snapshot.clone()))
            .collect()
    }

    pub fn mark_fully_cracked(&self, job_id: Uuid) {
        let mut jobs = self
            .fully_cracked_jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.insert(job_id);
    }

    pub fn is_fully_cracked(&self, job_id: Uuid) -> bool {
        let jobs = self
            .fully_cracked_jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.contains(&job_id)
    }
}
