// [apps/server/src/services/tasks.rs]
//! Task lifecycle: dispatch, progress promotion, completion with the
//! idempotent ACK, failure, and reconnect reconciliation.

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_db::repositories::{JobRepository, SettingsRepository, TaskRepository};
use krakenhashes_db::repositories::settings as setting_keys;
use krakenhashes_keyspace::{cascade_recompute, refine_rule_split, refine_single_task, CascadeChunk};
use krakenhashes_models::messages::{
    CurrentTaskStatusPayload, Envelope, JobProgressPayload, JobStatusPayload, JobStopPayload,
    MessageType, TaskAssignmentPayload, TaskCompleteAckPayload,
};
use krakenhashes_models::{JobStatus, JobTask, TaskStatus};

use crate::services::completion;
use crate::state::{AppState, TaskProgressSnapshot};

/// Creates the task row, flips it to `assigned`, and only then sends the
/// assignment envelope; a failed send reverts everything.
#[instrument(skip(state, task, payload), fields(task = %task.id, agent = agent_id))]
pub async fn dispatch_assignment(
    state: &AppState,
    task: &JobTask,
    agent_id: i64,
    payload: &TaskAssignmentPayload,
) -> anyhow::Result<bool> {
    let tasks = TaskRepository::new(state.db.clone());
    tasks.create(task).await?;
    tasks.assign(task.id, task.job_id, agent_id).await?;

    let envelope = Envelope::new(MessageType::TaskAssignment, payload)?;
    match state.connections.send(agent_id, envelope).await {
        Ok(()) => {
            info!("[TASKS]: task {} dispatched to agent {agent_id}", task.id);
            Ok(true)
        }
        Err(send_error) => {
            warn!("[TASKS]: assignment send failed, reverting: {send_error}");
            tasks.revert_assignment(task.id, agent_id).await?;
            Ok(false)
        }
    }
}

/// Progress handling: first report promotes assigned → running and stamps
/// the job/layer start; every report refreshes the progress map; an
/// all-hashes-cracked signal fans out before anything else can complete
/// the task.
pub async fn handle_progress(state: &AppState, agent_id: i64, progress: JobProgressPayload) {
    let tasks = TaskRepository::new(state.db.clone());
    let task = match tasks.try_get(progress.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!("[TASKS]: progress for unknown task {}", progress.task_id);
            return;
        }
        Err(db_error) => {
            error!("[TASKS]: progress lookup failed: {db_error}");
            return;
        }
    };
    if task.agent_id != Some(agent_id) && task.status.occupies_agent() {
        // Authorization: a task not assigned to this agent mutates nothing.
        warn!(
            "[TASKS]: agent {agent_id} reported progress for foreign task {}",
            progress.task_id
        );
        return;
    }

    match tasks.promote_running(task.id).await {
        Ok(true) => {
            let jobs = JobRepository::new(state.db.clone());
            if let Err(db_error) = jobs.mark_started(task.job_id).await {
                error!("[TASKS]: job start stamp failed: {db_error}");
            }
            if let Some(layer_id) = task.layer_id {
                if let Err(db_error) = jobs.mark_layer_started(layer_id).await {
                    error!("[TASKS]: layer start stamp failed: {db_error}");
                }
            }
        }
        Ok(false) => {}
        Err(db_error) => error!("[TASKS]: running promotion failed: {db_error}"),
    }

    state.progress.record(
        task.id,
        TaskProgressSnapshot {
            job_id: task.job_id,
            layer_id: task.layer_id,
            keyspace_processed: progress.keyspace_processed,
            effective_progress: progress.effective_progress,
            hash_rate: progress.hash_rate,
            cracked_count: progress.cracked_count,
            updated_at: std::time::Instant::now(),
        },
    );

    if progress.all_hashes_cracked {
        completion::handle_all_hashes_cracked(
            state.clone(),
            task.clone(),
            progress.cracked_count,
        );
    }
}

/// Terminal execution report from the agent.
pub async fn handle_job_status(state: &AppState, agent_id: i64, status: JobStatusPayload) {
    let tasks = TaskRepository::new(state.db.clone());
    let task = match tasks.try_get(status.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!("[TASKS]: job_status for unknown task {}", status.task_id);
            return;
        }
        Err(db_error) => {
            error!("[TASKS]: job_status lookup failed: {db_error}");
            return;
        }
    };
    if task.agent_id != Some(agent_id) && task.status.occupies_agent() {
        warn!("[TASKS]: agent {agent_id} reported status for foreign task {}", task.id);
        return;
    }

    match status.status.as_str() {
        "completed" => {
            run_progressive_refinement(state, &task, status.keyspace_processed).await;

            if status.cracked_count > 0 {
                // Park in processing while the crack pipeline drains; the
                // agent is freed to take new work immediately.
                match tasks.enter_processing(task.id, agent_id, status.cracked_count).await {
                    Ok(()) => info!(
                        "[TASKS]: task {} processing, expecting {} cracks",
                        task.id, status.cracked_count
                    ),
                    Err(db_error) => error!("[TASKS]: processing transition failed: {db_error}"),
                }
            } else {
                complete_task(state, &task, agent_id).await;
            }
        }
        "failed" => {
            let detail = status.error_message.unwrap_or_else(|| "agent reported failure".into());
            fail_task_and_job(state, &task, agent_id, &detail).await;
        }
        other => {
            // "stopped" and friends: the stop initiator already decided the
            // job-level outcome; just release the chunk and the agent.
            debug!("[TASKS]: task {} ended with status {other}", task.id);
            if let Err(db_error) = tasks.finish(task.id, Some(agent_id), TaskStatus::Failed).await {
                error!("[TASKS]: stop finish failed: {db_error}");
            }
        }
    }
}

/// Completes a task exactly once and always answers with the ACK. The
/// completion cache makes re-delivered completions cheap no-ops.
#[instrument(skip(state, task), fields(task = %task.id))]
pub async fn complete_task(state: &AppState, task: &JobTask, agent_id: i64) {
    if !state.completion_cache.first_completion(task.id) {
        debug!("[TASKS]: duplicate completion for {}, re-sending ACK only", task.id);
        send_task_complete_ack(state, agent_id, task.id).await;
        return;
    }

    let tasks = TaskRepository::new(state.db.clone());
    match tasks.finish(task.id, task.agent_id.or(Some(agent_id)), TaskStatus::Completed).await {
        Ok(true) => {}
        Ok(false) => debug!("[TASKS]: task {} was already terminal", task.id),
        Err(db_error) => {
            error!("[TASKS]: completion write failed for {}: {db_error}", task.id);
            return;
        }
    }
    state.progress.forget_task(task.id);

    finalize_job_if_drained(state, task.job_id).await;
    send_task_complete_ack(state, agent_id, task.id).await;
}

/// The ACK itself never mutates persistent state; re-sending is safe.
pub async fn send_task_complete_ack(state: &AppState, agent_id: i64, task_id: Uuid) {
    let payload = TaskCompleteAckPayload { task_id };
    match Envelope::new(MessageType::TaskCompleteAck, &payload) {
        Ok(envelope) => {
            if let Err(send_error) = state.connections.send(agent_id, envelope).await {
                warn!("[TASKS]: completion ACK send failed for {task_id}: {send_error}");
            }
        }
        Err(encode_error) => error!("[TASKS]: ACK encode failed: {encode_error}"),
    }
}

pub async fn fail_task_and_job(state: &AppState, task: &JobTask, agent_id: i64, detail: &str) {
    error!("[TASKS]: task {} failed permanently: {detail}", task.id);
    let tasks = TaskRepository::new(state.db.clone());
    if let Err(db_error) = tasks.set_detailed_status(task.id, detail).await {
        error!("[TASKS]: detail write failed: {db_error}");
    }
    if let Err(db_error) = tasks.finish(task.id, Some(agent_id), TaskStatus::Failed).await {
        error!("[TASKS]: failure transition failed: {db_error}");
    }
    state.progress.forget_task(task.id);

    let jobs = JobRepository::new(state.db.clone());
    if let Err(db_error) = jobs.set_status(task.job_id, JobStatus::Failed).await {
        error!("[TASKS]: job failure write failed: {db_error}");
    }
}

/// Sends `job_stop` for one task; the agent answers with `task_stop_ack`.
pub async fn send_job_stop(state: &AppState, task_id: Uuid, agent_id: i64, reason: &str) {
    let payload = JobStopPayload { task_id, stop_id: Uuid::new_v4(), reason: Some(reason.to_string()) };
    match Envelope::new(MessageType::JobStop, &payload) {
        Ok(envelope) => {
            if let Err(send_error) = state.connections.send(agent_id, envelope).await {
                warn!("[TASKS]: job_stop send failed for {task_id}: {send_error}");
            }
        }
        Err(encode_error) => error!("[TASKS]: job_stop encode failed: {encode_error}"),
    }
}

/// Marks the job completed once every chunk is terminal and no work
/// remains, claiming the single completion notification.
pub async fn finalize_job_if_drained(state: &AppState, job_id: Uuid) {
    let jobs = JobRepository::new(state.db.clone());
    let tasks = TaskRepository::new(state.db.clone());

    let job = match jobs.get(job_id).await {
        Ok(job) => job,
        Err(db_error) => {
            error!("[TASKS]: finalize lookup failed: {db_error}");
            return;
        }
    };
    if job.status == JobStatus::Completed || job.status == JobStatus::Failed {
        return;
    }
    if !job.is_work_exhausted() {
        return;
    }
    let all_tasks = match tasks.tasks_for_job(job_id).await {
        Ok(all_tasks) => all_tasks,
        Err(db_error) => {
            error!("[TASKS]: finalize task scan failed: {db_error}");
            return;
        }
    };
    if all_tasks.iter().any(|task| !task.status.is_terminal()) {
        return;
    }

    if let Err(db_error) = jobs.set_status(job_id, JobStatus::Completed).await {
        error!("[TASKS]: job completion write failed: {db_error}");
        return;
    }
    match jobs.claim_completion_email(job_id).await {
        Ok(true) => info!("[NOTIFY]: job {job_id} completed, completion notification queued"),
        Ok(false) => {}
        Err(db_error) => error!("[TASKS]: email claim failed: {db_error}"),
    }
}

/// Progressive keyspace refinement from a completed chunk's actual.
async fn run_progressive_refinement(state: &AppState, task: &JobTask, reported_actual: u64) {
    if reported_actual == 0 {
        return;
    }
    let tasks = TaskRepository::new(state.db.clone());
    let jobs = JobRepository::new(state.db.clone());

    if let Err(db_error) = tasks.store_chunk_actual(task.id, reported_actual).await {
        error!("[REFINE]: actual store failed: {db_error}");
        return;
    }

    let job = match jobs.get(task.job_id).await {
        Ok(job) => job,
        Err(db_error) => {
            error!("[REFINE]: job lookup failed: {db_error}");
            return;
        }
    };
    let all_tasks = match tasks.tasks_for_job(task.job_id).await {
        Ok(all_tasks) => all_tasks,
        Err(db_error) => {
            error!("[REFINE]: task scan failed: {db_error}");
            return;
        }
    };
    let current_effective = job.effective_keyspace.unwrap_or(0);

    if !job.uses_rule_splitting {
        // Single-task jobs: adopt the actual when it diverges meaningfully.
        // Keyspace-split chunks report the whole job's effective keyspace,
        // which is exactly what a single-chunk job wants and exactly wrong
        // for a multi-chunk one.
        if all_tasks.len() == 1 {
            if let Some(refined) = refine_single_task(current_effective, reported_actual) {
                info!("[REFINE]: job {} effective {} -> {refined}", job.id, current_effective);
                if let Err(db_error) = jobs.set_effective_keyspace(job.id, refined).await {
                    error!("[REFINE]: effective write failed: {db_error}");
                }
            }
        }
        return;
    }

    // Rule-splitting: extrapolate from observed per-rule averages.
    let mut sum_of_actuals: u64 = 0;
    let mut rules_covered: u32 = 0;
    for observed in &all_tasks {
        if let (Some(actual), Some(start), Some(end)) =
            (observed.chunk_actual_keyspace, observed.rule_start_index, observed.rule_end_index)
        {
            sum_of_actuals += actual;
            rules_covered += end.saturating_sub(start);
        }
    }
    let total_rules = job.multiplication_factor as u32;
    let rules_remaining = total_rules.saturating_sub(rules_covered);

    if let Some(refined) =
        refine_rule_split(sum_of_actuals, rules_covered, rules_remaining, current_effective)
    {
        info!("[REFINE]: rule-split job {} effective {} -> {refined}", job.id, current_effective);
        if let Err(db_error) = jobs.set_effective_keyspace(job.id, refined).await {
            error!("[REFINE]: effective write failed: {db_error}");
        }
    }

    // Cascade: re-base every chunk after this one so the effective chain
    // stays monotone. Keyspace-split chunks are excluded.
    let anchor_position = all_tasks.iter().position(|candidate| candidate.id == task.id);
    if let Some(position) = anchor_position {
        let anchor_end = all_tasks[position]
            .effective_keyspace_start
            .unwrap_or(0)
            .saturating_add(reported_actual);

        let tail = &all_tasks[position + 1..];
        let mut windows: Vec<CascadeChunk> = tail
            .iter()
            .map(|chunk| CascadeChunk {
                width: chunk.effective_width(),
                is_keyspace_split: chunk.is_keyspace_split,
                effective_start: chunk.effective_keyspace_start.unwrap_or(0),
                effective_end: chunk.effective_keyspace_end.unwrap_or(0),
            })
            .collect();

        let moved = cascade_recompute(anchor_end, &mut windows);
        if moved > 0 {
            for (chunk, window) in tail.iter().zip(windows.iter()) {
                if chunk.is_keyspace_split {
                    continue;
                }
                if let Err(db_error) = tasks
                    .set_effective_window(chunk.id, window.effective_start, window.effective_end)
                    .await
                {
                    error!("[REFINE]: cascade write failed: {db_error}");
                }
            }
            debug!("[REFINE]: cascade moved {moved} chunks after {}", task.id);
        }
    }
}

/// Reconnect reconciliation driven by the agent's `current_task_status`.
#[instrument(skip(state, status), fields(agent = agent_id))]
pub async fn reconcile_agent_state(
    state: &AppState,
    agent_id: i64,
    status: &CurrentTaskStatusPayload,
) {
    let tasks = TaskRepository::new(state.db.clone());
    let settings = SettingsRepository::new(state.db.clone());
    let max_retries = settings
        .get_u64(setting_keys::MAX_CHUNK_RETRY_ATTEMPTS)
        .await
        .unwrap_or(3) as u32;

    let parked = match tasks.parked_for_agent(agent_id).await {
        Ok(parked) => parked,
        Err(db_error) => {
            error!("[TASKS]: reconcile scan failed: {db_error}");
            return;
        }
    };

    for (task_id, retry_count) in parked {
        if status.has_running_task && status.task_id == Some(task_id) {
            // The agent kept working through the outage; restore ownership
            // so the grace sweeper leaves the chunk alone.
            let job_id = match status.job_id {
                Some(job_id) => job_id,
                None => match tasks.try_get(task_id).await {
                    Ok(Some(task)) => task.job_id,
                    _ => continue,
                },
            };
            match tasks.reclaim_parked(task_id, agent_id, job_id).await {
                Ok(true) => info!("[TASKS]: agent {agent_id} reclaimed task {task_id}"),
                Ok(false) => debug!("[TASKS]: reclaim guard lost for {task_id}"),
                Err(db_error) => error!("[TASKS]: reclaim failed: {db_error}"),
            }
            continue;
        }
        if retry_count < max_retries {
            match tasks.reset_for_retry(task_id).await {
                Ok(true) => info!("[TASKS]: parked task {task_id} reset for retry"),
                Ok(false) => {}
                Err(db_error) => error!("[TASKS]: retry reset failed: {db_error}"),
            }
        } else {
            warn!("[TASKS]: parked task {task_id} exhausted retries, failing");
            if let Err(db_error) = tasks.fail_permanently(task_id).await {
                error!("[TASKS]: permanent failure write failed: {db_error}");
            }
        }
    }
}
