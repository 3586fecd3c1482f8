// [apps/server/src/services/progress.rs]
//! Progress aggregation: a 2 s rollup from task snapshots through increment
//! layers up to the job counters, clamped to 100% once an
//! all-hashes-cracked signal landed.

use std::time::Duration;

use tracing::{debug, error, info};
use uuid::Uuid;

use krakenhashes_db::repositories::{JobRepository, TaskRepository};
use krakenhashes_models::{IncrementMode, JobStatus, TaskStatus};

use crate::state::AppState;

const ROLLUP_INTERVAL: Duration = Duration::from_secs(2);

pub fn spawn_progress_aggregator(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ROLLUP_INTERVAL);
        info!("[PROGRESS]: aggregator active every {ROLLUP_INTERVAL:?}");
        loop {
            ticker.tick().await;
            if let Err(rollup_error) = roll_up(&state).await {
                error!("[PROGRESS]: rollup failed: {rollup_error}");
            }
        }
    });
}

async fn roll_up(state: &AppState) -> anyhow::Result<()> {
    let jobs = JobRepository::new(state.db.clone());

    for job in jobs.schedulable().await? {
        if job.status != JobStatus::Running {
            continue;
        }

        if job.increment_mode != IncrementMode::Off {
            roll_up_layered(state, &jobs, job.id).await?;
        } else {
            let processed = settled_keyspace(state, job.id, None).await?
                + processed_from_snapshots(state, job.id, None);
            let clamped = clamp(state, job.id, processed, job.effective_keyspace);
            jobs.set_processed(job.id, clamped).await?;
        }
    }
    Ok(())
}

/// Keyspace already banked by finished chunks; live chunks contribute via
/// their snapshots instead.
async fn settled_keyspace(
    state: &AppState,
    job_id: Uuid,
    layer_id: Option<Uuid>,
) -> anyhow::Result<u64> {
    let tasks = TaskRepository::new(state.db.clone());
    Ok(tasks
        .tasks_for_job(job_id)
        .await?
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .filter(|task| layer_id.is_none() || task.layer_id == layer_id)
        .map(|task| task.effective_width())
        .sum())
}

/// Increment jobs: per-layer sums first, then the job as the layer total.
async fn roll_up_layered(
    state: &AppState,
    jobs: &JobRepository,
    job_id: Uuid,
) -> anyhow::Result<()> {
    let mut job_total: u64 = 0;
    for layer in jobs.layers_for_job(job_id).await? {
        let processed = settled_keyspace(state, job_id, Some(layer.id)).await?
            + processed_from_snapshots(state, job_id, Some(layer.id));
        let clamped = processed.min(layer.effective_keyspace.unwrap_or(u64::MAX));
        jobs.set_layer_processed(layer.id, clamped).await?;
        job_total += clamped;
    }
    let job = jobs.get(job_id).await?;
    let clamped = clamp(state, job_id, job_total, job.effective_keyspace);
    jobs.set_processed(job_id, clamped).await?;
    debug!("[PROGRESS]: layered job {job_id} at {clamped}");
    Ok(())
}

fn processed_from_snapshots(state: &AppState, job_id: Uuid, layer_id: Option<Uuid>) -> u64 {
    state
        .progress
        .snapshots_for_job(job_id)
        .into_iter()
        .filter(|(_, snapshot)| layer_id.is_none() || snapshot.layer_id == layer_id)
        .map(|(_, snapshot)| snapshot.effective_progress)
        .sum()
}

/// Processed never exceeds effective; a fully-cracked job reads as exactly
/// 100% regardless of how much keyspace was actually walked.
fn clamp(state: &AppState, job_id: Uuid, processed: u64, effective: Option<u64>) -> u64 {
    let ceiling = effective.unwrap_or(u64::MAX);
    if state.progress.is_fully_cracked(job_id) {
        return ceiling;
    }
    processed.min(ceiling)
}
