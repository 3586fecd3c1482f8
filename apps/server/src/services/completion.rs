// [apps/server/src/services/completion.rs]
//! Hashlist completion fan-out. When any agent reports the cracker's
//! "all hashes cracked" status, every other job on the same hashlist is
//! moot: running peers are stopped and completed, never-started peers are
//! deleted. The signal is trusted as-is; hashcat saw the last hash fall.

use std::time::Duration;

use tracing::{error, info, instrument, warn};

use krakenhashes_db::repositories::{JobRepository, TaskRepository};
use krakenhashes_models::{JobStatus, JobTask};

use crate::services::tasks as task_service;
use crate::state::AppState;

/// Hard budget for the whole fan-out.
const FANOUT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Entry point, detached from the read path. The fan-out must land before
/// the triggering task's own completion can early-return anything.
pub fn handle_all_hashes_cracked(state: AppState, task: JobTask, expected_cracks: u64) {
    tokio::spawn(async move {
        if tokio::time::timeout(FANOUT_TIMEOUT, fan_out(&state, &task, expected_cracks))
            .await
            .is_err()
        {
            error!("[COMPLETION]: fan-out for job {} exceeded its time budget", task.job_id);
        }
    });
}

#[instrument(skip(state, task), fields(job = %task.job_id))]
async fn fan_out(state: &AppState, task: &JobTask, expected_cracks: u64) {
    if state.progress.is_fully_cracked(task.job_id) {
        // A second task on the same job raced us; the first pass won.
        return;
    }
    state.progress.mark_fully_cracked(task.job_id);
    info!("[COMPLETION]: hashlist fully cracked via job {}", task.job_id);

    let jobs = JobRepository::new(state.db.clone());
    let tasks = TaskRepository::new(state.db.clone());

    // Pin the triggering job's view to 100%.
    if let Err(db_error) = jobs.sync_keyspace_to_processed(task.job_id).await {
        error!("[COMPLETION]: keyspace sync failed: {db_error}");
    }

    let hashlist_id = match jobs.get(task.job_id).await {
        Ok(job) => job.hashlist_id,
        Err(db_error) => {
            error!("[COMPLETION]: job lookup failed: {db_error}");
            return;
        }
    };

    let peers = match jobs.live_jobs_for_hashlist(hashlist_id).await {
        Ok(peers) => peers,
        Err(db_error) => {
            error!("[COMPLETION]: peer scan failed: {db_error}");
            return;
        }
    };

    for (peer_id, peer_status) in peers {
        if peer_id == task.job_id {
            continue;
        }
        match peer_status {
            JobStatus::Pending => {
                // Never started: nothing ran, nothing to keep.
                match jobs.delete_pending(peer_id).await {
                    Ok(true) => info!("[COMPLETION]: pending peer job {peer_id} deleted"),
                    Ok(false) => warn!("[COMPLETION]: peer {peer_id} escaped deletion"),
                    Err(db_error) => error!("[COMPLETION]: peer delete failed: {db_error}"),
                }
            }
            JobStatus::Running | JobStatus::Paused => {
                let live = tasks.live_tasks_for_job(peer_id).await.unwrap_or_default();
                for (peer_task_id, peer_agent) in live {
                    if let Some(agent_id) = peer_agent {
                        task_service::send_job_stop(
                            state,
                            peer_task_id,
                            agent_id,
                            "hashlist fully cracked",
                        )
                        .await;
                    }
                    if let Err(db_error) = tasks
                        .finish(peer_task_id, peer_agent, krakenhashes_models::TaskStatus::Completed)
                        .await
                    {
                        error!("[COMPLETION]: peer task finish failed: {db_error}");
                    }
                }
                if let Err(db_error) = jobs.sync_keyspace_to_processed(peer_id).await {
                    error!("[COMPLETION]: peer keyspace sync failed: {db_error}");
                }
                if let Err(db_error) = jobs.set_status(peer_id, JobStatus::Completed).await {
                    error!("[COMPLETION]: peer completion failed: {db_error}");
                } else {
                    state.progress.mark_fully_cracked(peer_id);
                    match jobs.claim_completion_email(peer_id).await {
                        Ok(true) => {
                            info!("[NOTIFY]: job {peer_id} completed (hashlist fully cracked)")
                        }
                        Ok(false) => {}
                        Err(db_error) => error!("[COMPLETION]: email claim failed: {db_error}"),
                    }
                }
            }
            _ => {}
        }
    }

    // The triggering task still owes its final crack batches: with cracks
    // expected it parks in processing via the normal job_status path, and
    // the job completes when its pipeline drains.
    if expected_cracks == 0 {
        task_service::finalize_job_if_drained(state, task.job_id).await;
    }
}
