// [apps/server/src/services/scheduler.rs]
//! The scheduling cycle: refresh jobs and agents, run the benchmark round,
//! then hand out chunks constrained-first within each priority band.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_db::repositories::settings as setting_keys;
use krakenhashes_db::repositories::{
    AgentRepository, BenchmarkRepository, JobRepository, SettingsRepository, TaskRepository,
};
use krakenhashes_keyspace::{
    base_keyspace_for_mask, layer_masks, plan_chunk, rule_chunk_bounds, write_rule_chunk,
};
use krakenhashes_models::messages::TaskAssignmentPayload;
use krakenhashes_models::{
    Agent, AttackMode, BinaryPattern, IncrementLayer, IncrementMode, JobExecution, JobTask,
    TaskStatus,
};

use crate::services::benchmark;
use crate::services::materials::{resolve_job_materials, salt_count_for, JobMaterials};
use crate::services::tasks as task_service;
use crate::state::AppState;

/// Cycle cadence; each tick runs to completion before the next starts.
const CYCLE_INTERVAL: Duration = Duration::from_secs(5);
/// Grace in seconds before a reconnect-parked chunk returns to the pending
/// pool.
const RECONNECT_GRACE_SECS: i64 = 120;

pub fn spawn_scheduler(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CYCLE_INTERVAL);
        info!("[SCHEDULER]: cycle active every {CYCLE_INTERVAL:?}");
        loop {
            ticker.tick().await;
            if let Err(cycle_error) = run_cycle(&state).await {
                error!("[SCHEDULER]: cycle failed: {cycle_error}");
            }
        }
    });
}

#[instrument(skip(state))]
pub async fn run_cycle(state: &AppState) -> anyhow::Result<()> {
    let jobs_repo = JobRepository::new(state.db.clone());
    let agents_repo = AgentRepository::new(state.db.clone());
    let tasks_repo = TaskRepository::new(state.db.clone());
    let benchmarks_repo = BenchmarkRepository::new(state.db.clone());

    sweep_expired_parked(&tasks_repo).await;

    // 1. Jobs with work left (or with no accurate keyspace yet, which the
    //    benchmark round will fix), not already at max_agents.
    let mut candidate_jobs: Vec<JobExecution> = Vec::new();
    for job in jobs_repo.schedulable().await? {
        ensure_layers(&jobs_repo, &job).await?;
        if job.is_accurate_keyspace && job.remaining_keyspace() == 0 && !has_layer_work(state, &job).await {
            continue;
        }
        let live = jobs_repo.live_assignment_count(job.id).await?;
        if job.max_agents > 0 && live >= job.max_agents as u64 {
            continue;
        }
        candidate_jobs.push(job);
    }
    if candidate_jobs.is_empty() {
        return Ok(());
    }

    // 2. Free agents that are actually connected and not benchmark-locked.
    let locked: Vec<i64> = benchmarks_repo.agents_with_pending_requests().await?;
    let free_agents: Vec<Agent> = agents_repo
        .available()
        .await?
        .into_iter()
        .filter(|agent| state.connections.is_online(agent.id))
        .filter(|agent| !locked.contains(&agent.id))
        .collect();
    if free_agents.is_empty() {
        return Ok(());
    }

    // 3. Compatibility matrix.
    let matrix = CompatibilityMatrix::build(&candidate_jobs, &free_agents);

    // 4. Benchmark round; blocks this cycle until it settles.
    let round = benchmark::plan_and_execute(state, &candidate_jobs, &free_agents).await;

    // 5. Re-read agents: the round released some, consumed none for good.
    let mut assignable: Vec<Agent> = agents_repo
        .available()
        .await?
        .into_iter()
        .filter(|agent| state.connections.is_online(agent.id))
        .collect();

    // Agents that just ran a forced benchmark get the first chunk of the
    // job they measured.
    for (agent_id, job_id) in &round.forced_pairs {
        if let Some(position) = assignable.iter().position(|agent| agent.id == *agent_id) {
            let agent = assignable.remove(position);
            if let Some(job) = candidate_jobs.iter().find(|job| job.id == *job_id) {
                let refreshed = jobs_repo.get(job.id).await?;
                if let Err(assign_error) = assign_one(state, &refreshed, &agent).await {
                    warn!("[SCHEDULER]: forced-pair assignment failed: {assign_error}");
                }
            }
        }
    }

    // 6. Constrained-first inside each priority band, FIFO across bands.
    let mut bands: Vec<(i32, Vec<&JobExecution>)> = Vec::new();
    for job in &candidate_jobs {
        match bands.last_mut() {
            Some((priority, band)) if *priority == job.priority => band.push(job),
            _ => bands.push((job.priority, vec![job])),
        }
    }

    for (_, mut band) in bands {
        band.sort_by_key(|job| (matrix.agents_for_job(job.id), job.created_at));
        for job in band {
            let refreshed = jobs_repo.get(job.id).await?;
            let live = jobs_repo.live_assignment_count(refreshed.id).await?;
            let mut slots = if refreshed.max_agents == 0 {
                assignable.len() as u64
            } else {
                (refreshed.max_agents as u64).saturating_sub(live)
            };

            while slots > 0 {
                // Least flexible compatible agent first, so specialists are
                // not consumed by unconstrained work.
                let Some(position) = matrix.least_flexible_compatible(&assignable, refreshed.id)
                else {
                    break;
                };
                let agent = assignable.remove(position);
                match assign_one(state, &refreshed, &agent).await {
                    Ok(true) => slots -= 1,
                    Ok(false) => {
                        // No chunk left for this job; put the agent back.
                        assignable.push(agent);
                        break;
                    }
                    Err(assign_error) => {
                        warn!("[SCHEDULER]: assignment failed: {assign_error}");
                        assignable.push(agent);
                        break;
                    }
                }
            }
            if assignable.is_empty() {
                return Ok(());
            }
        }
    }

    Ok(())
}

async fn sweep_expired_parked(tasks_repo: &TaskRepository) {
    let cutoff = Utc::now() - chrono::Duration::seconds(RECONNECT_GRACE_SECS);
    match tasks_repo.parked_expired(cutoff).await {
        Ok(expired) => {
            for task_id in expired {
                match tasks_repo.reset_for_retry(task_id).await {
                    Ok(true) => info!("[SCHEDULER]: parked task {task_id} returned to pending"),
                    Ok(false) => {}
                    Err(db_error) => error!("[SCHEDULER]: park sweep failed: {db_error}"),
                }
            }
        }
        Err(db_error) => error!("[SCHEDULER]: park scan failed: {db_error}"),
    }
}

/// Creates increment layers on first contact with an increment job. Mask
/// attacks carry no rules, so the charset product is the layer's true
/// effective keyspace.
async fn ensure_layers(jobs_repo: &JobRepository, job: &JobExecution) -> anyhow::Result<()> {
    if job.increment_mode == IncrementMode::Off {
        return Ok(());
    }
    if !jobs_repo.layers_for_job(job.id).await?.is_empty() {
        return Ok(());
    }
    let Some(mask) = &job.mask else {
        warn!("[SCHEDULER]: increment job {} has no mask", job.id);
        return Ok(());
    };
    let inverse = job.increment_mode == IncrementMode::IncrementInverse;
    let min = job.increment_min.unwrap_or(1);
    let max = job.increment_max.unwrap_or(u32::MAX);

    let mut job_total: u64 = 0;
    for (length, layer_mask) in layer_masks(mask, min, max, inverse)? {
        let base = base_keyspace_for_mask(&layer_mask)?;
        job_total += base;
        let layer = IncrementLayer {
            id: Uuid::new_v4(),
            job_id: job.id,
            mask_length: length,
            layer_mask,
            status: krakenhashes_models::JobStatus::Pending,
            base_keyspace: Some(base),
            effective_keyspace: Some(base),
            is_accurate_keyspace: true,
            dispatched_keyspace: 0,
            processed_keyspace: 0,
            started_at: None,
        };
        jobs_repo.create_layer(&layer).await?;
    }
    // The job total is the layer sum, and it is exact for pure masks.
    jobs_repo.calibrate_keyspace(job.id, job_total, None).await?;
    info!("[SCHEDULER]: job {} decomposed into increment layers ({job_total} total)", job.id);
    Ok(())
}

async fn has_layer_work(state: &AppState, job: &JobExecution) -> bool {
    if job.increment_mode == IncrementMode::Off {
        return false;
    }
    let jobs_repo = JobRepository::new(state.db.clone());
    jobs_repo
        .layers_for_job(job.id)
        .await
        .map(|layers| layers.iter().any(|layer| layer.remaining_keyspace() > 0))
        .unwrap_or(false)
}

struct CompatibilityMatrix {
    job_to_agents: HashMap<Uuid, Vec<i64>>,
    agent_to_jobs: HashMap<i64, Vec<Uuid>>,
}

impl CompatibilityMatrix {
    fn build(jobs: &[JobExecution], agents: &[Agent]) -> Self {
        let mut job_to_agents: HashMap<Uuid, Vec<i64>> = HashMap::new();
        let mut agent_to_jobs: HashMap<i64, Vec<Uuid>> = HashMap::new();

        for job in jobs {
            let job_pattern = BinaryPattern::parse(&job.binary_pattern)
                .unwrap_or(BinaryPattern::Default);
            for agent in agents {
                let agent_pattern = BinaryPattern::parse(&agent.binary_pattern)
                    .unwrap_or(BinaryPattern::Default);
                if BinaryPattern::is_compatible(&agent_pattern, &job_pattern) {
                    job_to_agents.entry(job.id).or_default().push(agent.id);
                    agent_to_jobs.entry(agent.id).or_default().push(job.id);
                }
            }
        }
        Self { job_to_agents, agent_to_jobs }
    }

    /// Constraint score: fewer compatible agents sorts first.
    fn agents_for_job(&self, job_id: Uuid) -> usize {
        self.job_to_agents.get(&job_id).map(Vec::len).unwrap_or(0)
    }

    /// Index of the compatible agent with the fewest compatible jobs.
    fn least_flexible_compatible(&self, agents: &[Agent], job_id: Uuid) -> Option<usize> {
        let compatible = self.job_to_agents.get(&job_id)?;
        agents
            .iter()
            .enumerate()
            .filter(|(_, agent)| compatible.contains(&agent.id))
            .min_by_key(|(_, agent)| {
                self.agent_to_jobs.get(&agent.id).map(Vec::len).unwrap_or(usize::MAX)
            })
            .map(|(position, _)| position)
    }
}

/// One (job, agent) assignment: plan the chunk, create the task, dispatch.
/// Returns Ok(false) when the job has no chunk to give.
#[instrument(skip(state, job, agent), fields(job = %job.id, agent = agent.id))]
async fn assign_one(state: &AppState, job: &JobExecution, agent: &Agent) -> anyhow::Result<bool> {
    let Some(chunk) = next_chunk(state, job, agent).await? else {
        return Ok(false);
    };
    let materials = resolve_job_materials(state, job).await?;

    let task = JobTask {
        id: Uuid::new_v4(),
        job_id: job.id,
        layer_id: chunk.layer_id,
        agent_id: None,
        status: TaskStatus::Pending,
        keyspace_start: chunk.keyspace_start,
        keyspace_end: chunk.keyspace_end,
        effective_keyspace_start: Some(chunk.effective_start),
        effective_keyspace_end: Some(chunk.effective_end),
        chunk_actual_keyspace: None,
        is_keyspace_split: chunk.is_keyspace_split,
        is_rule_split: chunk.is_rule_split,
        rule_chunk_path: chunk.rule_chunk_rel_path.clone(),
        rule_start_index: chunk.rule_start,
        rule_end_index: chunk.rule_end,
        expected_crack_count: 0,
        received_crack_count: 0,
        batches_complete_signaled: false,
        retry_count: 0,
        retransmit_count: 0,
        detailed_status: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let payload = build_assignment(state, job, agent, &task, &chunk, &materials).await?;
    let dispatched = task_service::dispatch_assignment(state, &task, agent.id, &payload).await?;
    if !dispatched {
        return Ok(false);
    }

    let jobs_repo = JobRepository::new(state.db.clone());
    match chunk.layer_id {
        Some(layer_id) => {
            jobs_repo.add_layer_dispatched(layer_id, chunk.effective_width).await?;
            jobs_repo.add_dispatched(job.id, chunk.effective_width).await?;
        }
        None => jobs_repo.add_dispatched(job.id, chunk.effective_width).await?,
    }
    Ok(true)
}

struct ChunkSpec {
    layer_id: Option<Uuid>,
    mask_override: Option<String>,
    keyspace_start: u64,
    keyspace_end: u64,
    effective_start: u64,
    effective_end: u64,
    effective_width: u64,
    is_keyspace_split: bool,
    is_rule_split: bool,
    rule_chunk_rel_path: Option<String>,
    rule_start: Option<u32>,
    rule_end: Option<u32>,
}

/// Plans the next chunk of a job for an agent: a rule range for
/// rule-splitting jobs, a layer slice for increment jobs, a keyspace range
/// otherwise.
async fn next_chunk(
    state: &AppState,
    job: &JobExecution,
    agent: &Agent,
) -> anyhow::Result<Option<ChunkSpec>> {
    let settings = SettingsRepository::new(state.db.clone());
    let benchmarks = BenchmarkRepository::new(state.db.clone());
    let tasks_repo = TaskRepository::new(state.db.clone());
    let jobs_repo = JobRepository::new(state.db.clone());

    let chunk_duration = settings.get_u64(setting_keys::DEFAULT_CHUNK_DURATION).await?;
    let fluctuation = settings.get_u64(setting_keys::CHUNK_FLUCTUATION_PERCENTAGE).await?;

    let hashes = krakenhashes_db::repositories::HashRepository::new(state.db.clone());
    let uncracked = hashes
        .get_hashlist(job.hashlist_id)
        .await
        .map(|hashlist| hashlist.total - hashlist.cracked_count.min(hashlist.total))
        .unwrap_or(0);
    let speed = benchmarks
        .get_speed(
            agent.id,
            job.attack_mode.as_u8(),
            job.hash_type,
            salt_count_for(job, uncracked),
        )
        .await?
        .map(|benchmark| benchmark.speed)
        .unwrap_or(0);
    if speed == 0 {
        debug!("[SCHEDULER]: no benchmark for agent {} on job {}", agent.id, job.id);
        return Ok(None);
    }

    // Increment jobs: schedule layers independently, honoring the mode's
    // direction through the layer creation order.
    if job.increment_mode != IncrementMode::Off {
        let mut layers = jobs_repo.layers_for_job(job.id).await?;
        if job.increment_mode == IncrementMode::IncrementInverse {
            layers.reverse();
        }
        for layer in layers {
            let remaining = layer.remaining_keyspace();
            let Some(plan) = plan_chunk(remaining, speed, chunk_duration, fluctuation) else {
                continue;
            };
            let start = layer.dispatched_keyspace;
            return Ok(Some(ChunkSpec {
                layer_id: Some(layer.id),
                mask_override: Some(layer.layer_mask.clone()),
                keyspace_start: start,
                keyspace_end: start + plan.size,
                effective_start: start,
                effective_end: start + plan.size,
                effective_width: plan.size,
                is_keyspace_split: true,
                is_rule_split: false,
                rule_chunk_rel_path: None,
                rule_start: None,
                rule_end: None,
            }));
        }
        return Ok(None);
    }

    // Rule-splitting: the chunk is a rule range over the full wordlist.
    if job.uses_rule_splitting {
        let existing = tasks_repo.tasks_for_job(job.id).await?;
        let next_index = existing.iter().filter(|task| task.is_rule_split).count() as u32;
        let total_rules = job.multiplication_factor as u32;
        let Some((rule_start, rule_end)) =
            rule_chunk_bounds(total_rules, job.rule_split_count, next_index)
        else {
            return Ok(None);
        };

        let materials = resolve_job_materials(state, job).await?;
        let source_rule = materials
            .rule_paths
            .first()
            .ok_or_else(|| anyhow::anyhow!("rule-splitting job {} has no rule file", job.id))?;
        let job_dir = job.id.to_string();
        let chunk_name = format!("chunk_{next_index}.rule");
        let relative = format!("rules/chunks/{job_dir}/{chunk_name}");
        write_rule_chunk(
            &state.files_root.join(source_rule),
            &state.files_root.join(&relative),
            rule_start,
            rule_end,
        )
        .await?;

        // Effective share of this rule range, by proportion, never past the
        // job's remaining work.
        let effective_total = job.effective_keyspace.unwrap_or(0);
        let width = ((effective_total as f64 * (rule_end - rule_start) as f64
            / total_rules.max(1) as f64) as u64)
            .min(job.remaining_keyspace());
        let effective_start = job.dispatched_keyspace;

        return Ok(Some(ChunkSpec {
            layer_id: None,
            mask_override: None,
            keyspace_start: 0,
            keyspace_end: 0,
            effective_start,
            effective_end: effective_start + width,
            effective_width: width,
            is_keyspace_split: false,
            is_rule_split: true,
            rule_chunk_rel_path: Some(relative),
            rule_start: Some(rule_start),
            rule_end: Some(rule_end),
        }));
    }

    // Plain keyspace split with --skip/--limit in base units.
    let Some(plan) = plan_chunk(job.remaining_keyspace(), speed, chunk_duration, fluctuation)
    else {
        return Ok(None);
    };
    let base_total = job.base_keyspace.unwrap_or(0);
    let effective_total = job.effective_keyspace.unwrap_or(0).max(1);
    let ratio = if base_total > 0 { effective_total as f64 / base_total as f64 } else { 1.0 };

    let existing = tasks_repo.tasks_for_job(job.id).await?;
    let base_cursor = existing.iter().map(|task| task.keyspace_end).max().unwrap_or(0);
    let base_width = ((plan.size as f64 / ratio).ceil() as u64).max(1);
    let base_end = if base_total > 0 {
        if plan.is_final { base_total } else { (base_cursor + base_width).min(base_total) }
    } else {
        base_cursor + base_width
    };

    let effective_start = job.dispatched_keyspace;
    Ok(Some(ChunkSpec {
        layer_id: None,
        mask_override: None,
        keyspace_start: base_cursor,
        keyspace_end: base_end,
        effective_start,
        effective_end: effective_start + plan.size,
        effective_width: plan.size,
        is_keyspace_split: true,
        is_rule_split: false,
        rule_chunk_rel_path: None,
        rule_start: None,
        rule_end: None,
    }))
}

async fn build_assignment(
    state: &AppState,
    job: &JobExecution,
    agent: &Agent,
    task: &JobTask,
    chunk: &ChunkSpec,
    materials: &JobMaterials,
) -> anyhow::Result<TaskAssignmentPayload> {
    let settings = SettingsRepository::new(state.db.clone());
    let chunk_duration = settings.get_u64(setting_keys::DEFAULT_CHUNK_DURATION).await?;
    let report_interval = settings.get_u64(setting_keys::REPORT_INTERVAL_SECONDS).await?;

    let rule_paths = match &chunk.rule_chunk_rel_path {
        Some(chunk_path) => vec![chunk_path.clone()],
        None => materials.rule_paths.clone(),
    };
    let enabled = agent.enabled_device_ids();

    // Layer tasks hand the agent a fixed-length mask and no increment
    // flags; only never-layered increment jobs would carry them, and those
    // are decomposed before dispatch, so assignments never do.
    Ok(TaskAssignmentPayload {
        task_id: task.id,
        job_execution_id: job.id,
        hashlist_id: job.hashlist_id,
        hashlist_path: materials.hashlist_path.clone(),
        attack_mode: job.attack_mode.as_u8(),
        hash_type: job.hash_type,
        keyspace_start: chunk.keyspace_start,
        keyspace_end: chunk.keyspace_end,
        wordlist_paths: materials.wordlist_paths.clone(),
        rule_paths,
        mask: chunk.mask_override.clone().or_else(|| job.mask.clone()),
        binary_path: materials.binary_path.clone(),
        chunk_duration,
        report_interval,
        output_format: "3".to_string(),
        extra_parameters: agent.extra_parameters.clone(),
        enabled_devices: (!enabled.is_empty()).then_some(enabled),
        is_keyspace_split: chunk.is_keyspace_split,
        increment_mode: None,
        increment_min: None,
        increment_max: None,
    })
}

/// Association jobs serve the original upload rather than the processed
/// file; the agent flags it from the attack mode.
pub fn is_association(job: &JobExecution) -> bool {
    job.attack_mode == AttackMode::Association
}
