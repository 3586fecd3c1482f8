// [apps/server/src/services/benchmark.rs]
//! Benchmark planning and result recording. Benchmarks gate scheduling:
//! the cycle plans one request per agent, fires them in parallel, then
//! blocks polling the request rows until they settle or time out.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_db::repositories::settings as setting_keys;
use krakenhashes_db::repositories::{
    BenchmarkRepository, HashRepository, JobRepository, SettingsRepository, TaskRepository,
};
use krakenhashes_keyspace::{should_split_rules, split_count};
use krakenhashes_models::messages::{
    BenchmarkRequestPayload, BenchmarkResultPayload, Envelope, MessageType,
};
use krakenhashes_models::{Agent, BinaryPattern, JobExecution};

use crate::services::materials::{resolve_job_materials, salt_count_for};
use crate::state::AppState;

/// Poll cadence while a benchmark round blocks the scheduling cycle.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What one planning round produced.
#[derive(Debug, Default)]
pub struct BenchmarkRound {
    pub request_ids: Vec<Uuid>,
    /// Agents tied up by this round; excluded from assignment until done.
    pub locked_agents: Vec<i64>,
    /// Agents that ran a forced benchmark, keyed to the job they measured;
    /// they get the first chunk of that job afterwards.
    pub forced_pairs: Vec<(i64, Uuid)>,
}

/// Plans and fires benchmark requests for the cycle, then blocks until all
/// request rows settle or the timeout expires.
#[instrument(skip(state, jobs, agents), fields(jobs = jobs.len(), agents = agents.len()))]
pub async fn plan_and_execute(
    state: &AppState,
    jobs: &[JobExecution],
    agents: &[Agent],
) -> BenchmarkRound {
    let settings = SettingsRepository::new(state.db.clone());
    let benchmarks = BenchmarkRepository::new(state.db.clone());
    let tasks = TaskRepository::new(state.db.clone());
    let hashes = HashRepository::new(state.db.clone());

    let cache_hours = settings
        .get_u64(setting_keys::BENCHMARK_CACHE_DURATION_HOURS)
        .await
        .unwrap_or(168) as i64;
    let speedtest_timeout = settings
        .get_u64(setting_keys::SPEEDTEST_TIMEOUT_SECONDS)
        .await
        .unwrap_or(180);

    let mut round = BenchmarkRound::default();
    let mut used_agents: HashSet<i64> = HashSet::new();
    let now = Utc::now();

    // Jobs ordered by priority already; round-robin one request per agent.
    let mut agent_cursor = agents.iter();

    for job in jobs {
        let uncracked = hashes
            .get_hashlist(job.hashlist_id)
            .await
            .map(|hashlist| hashlist.total - hashlist.cracked_count.min(hashlist.total))
            .unwrap_or(0);
        let salt_count = salt_count_for(job, uncracked);

        // Forced benchmark: a never-run job without an accurate keyspace
        // needs the real attack probed for progress[1].
        let task_count = tasks.count_for_job(job.id).await.unwrap_or(0);
        let needs_forced = task_count == 0 && !job.is_accurate_keyspace;

        let job_pattern =
            BinaryPattern::parse(&job.binary_pattern).unwrap_or(BinaryPattern::Default);

        for agent in agent_cursor.by_ref() {
            if used_agents.contains(&agent.id) {
                continue;
            }
            // Never benchmark an agent for a job it cannot run.
            let agent_pattern =
                BinaryPattern::parse(&agent.binary_pattern).unwrap_or(BinaryPattern::Default);
            if !BinaryPattern::is_compatible(&agent_pattern, &job_pattern) {
                continue;
            }
            let has_speed = benchmarks
                .has_fresh_speed(
                    agent.id,
                    job.attack_mode.as_u8(),
                    job.hash_type,
                    salt_count,
                    now,
                    cache_hours,
                )
                .await
                .unwrap_or(false);

            if has_speed && !needs_forced {
                // This agent is ready for this job; no benchmark to plan.
                continue;
            }

            let forced = needs_forced;
            match fire_request(state, agent, job, salt_count, forced, speedtest_timeout).await {
                Ok(request_id) => {
                    used_agents.insert(agent.id);
                    round.request_ids.push(request_id);
                    round.locked_agents.push(agent.id);
                    if forced {
                        round.forced_pairs.push((agent.id, job.id));
                    }
                }
                Err(plan_error) => {
                    warn!("[BENCHMARK]: planning failed for agent {}: {plan_error}", agent.id);
                }
            }
            // One benchmark per agent per cycle; move to the next job.
            break;
        }
    }

    if round.request_ids.is_empty() {
        return round;
    }

    info!("[BENCHMARK]: {} requests fired, blocking cycle", round.request_ids.len());
    wait_for_round(state, &round.request_ids, speedtest_timeout).await;
    round
}

async fn fire_request(
    state: &AppState,
    agent: &Agent,
    job: &JobExecution,
    salt_count: Option<u64>,
    forced: bool,
    speedtest_timeout: u64,
) -> anyhow::Result<Uuid> {
    let materials = resolve_job_materials(state, job).await?;
    let request_id = Uuid::new_v4();

    let benchmarks = BenchmarkRepository::new(state.db.clone());
    benchmarks
        .create_request(
            request_id,
            agent.id,
            forced.then_some(job.id),
            None,
            job.attack_mode.as_u8(),
            job.hash_type,
            salt_count,
            forced,
        )
        .await?;

    let payload = BenchmarkRequestPayload {
        request_id,
        attack_mode: job.attack_mode.as_u8(),
        hash_type: job.hash_type,
        salt_count,
        job_execution_id: forced.then_some(job.id),
        layer_id: None,
        forced,
        hashlist_path: materials.hashlist_path,
        mask: job.mask.clone(),
        wordlist_paths: materials.wordlist_paths,
        rule_paths: materials.rule_paths,
        binary_path: materials.binary_path,
        timeout_seconds: speedtest_timeout,
    };
    let envelope = Envelope::new(MessageType::BenchmarkRequest, &payload)?;
    state.connections.send(agent.id, envelope).await?;
    debug!("[BENCHMARK]: request {request_id} sent to agent {}", agent.id);
    Ok(request_id)
}

/// Polls the request rows every 500 ms until all settle or the round times
/// out (speedtest timeout plus a scheduler buffer).
async fn wait_for_round(state: &AppState, request_ids: &[Uuid], speedtest_timeout: u64) {
    let benchmarks = BenchmarkRepository::new(state.db.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(speedtest_timeout + 5);

    loop {
        match benchmarks.pending_count(request_ids).await {
            Ok(0) => {
                info!("[BENCHMARK]: round settled");
                return;
            }
            Ok(pending) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("[BENCHMARK]: round timed out with {pending} requests still pending");
                    for request_id in request_ids {
                        let _ = benchmarks.fail_request(*request_id).await;
                    }
                    return;
                }
            }
            Err(db_error) => {
                error!("[BENCHMARK]: poll failed: {db_error}");
                return;
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Records an agent's benchmark result: the speed row, first-benchmark
/// keyspace calibration, and the deferred rule-splitting decision.
#[instrument(skip(state, result), fields(request = %result.request_id, agent = agent_id))]
pub async fn record_result(state: &AppState, agent_id: i64, result: BenchmarkResultPayload) {
    let benchmarks = BenchmarkRepository::new(state.db.clone());

    let context = match benchmarks.request_context(result.request_id).await {
        Ok(Some(context)) => context,
        Ok(None) => {
            warn!("[BENCHMARK]: result for unknown request {}", result.request_id);
            return;
        }
        Err(db_error) => {
            error!("[BENCHMARK]: request lookup failed: {db_error}");
            return;
        }
    };
    let (request_agent, job_id, layer_id, forced) = context;
    if request_agent != agent_id {
        warn!("[BENCHMARK]: agent {agent_id} answered a request issued to {request_agent}");
        return;
    }

    if let Some(failure) = &result.error_message {
        warn!("[BENCHMARK]: request {} failed on agent: {failure}", result.request_id);
        let _ = benchmarks.fail_request(result.request_id).await;
        return;
    }

    if let Err(db_error) = benchmarks
        .record_speed(agent_id, result.attack_mode, result.hash_type, result.salt_count, result.speed)
        .await
    {
        error!("[BENCHMARK]: speed write failed: {db_error}");
    }

    let jobs = JobRepository::new(state.db.clone());

    if let Some(layer_id) = layer_id {
        if let Some(total) = result.total_keyspace {
            if let Err(db_error) = jobs.calibrate_layer(layer_id, total).await {
                error!("[BENCHMARK]: layer calibration failed: {db_error}");
            }
            // An accurately measured layer makes the parent job accurate:
            // the layer sum is now grounded in a real probe.
            if let Some(job_id) = job_id {
                if let Err(db_error) = jobs.calibrate_keyspace(job_id, layer_sum(state, job_id).await, None).await {
                    error!("[BENCHMARK]: parent calibration failed: {db_error}");
                }
            }
        }
    } else if let (Some(job_id), Some(total), true) = (job_id, result.total_keyspace, forced) {
        match jobs.get(job_id).await {
            Ok(job) => {
                // avg_rule_multiplier only exists when base and rules are
                // known; effective/(base × factor) is the observed yield.
                let multiplier = job.base_keyspace.and_then(|base| {
                    let denominator = (base as f64) * (job.multiplication_factor as f64);
                    (denominator > 0.0).then(|| total as f64 / denominator)
                });
                if let Err(db_error) = jobs.calibrate_keyspace(job_id, total, multiplier).await {
                    error!("[BENCHMARK]: keyspace calibration failed: {db_error}");
                } else {
                    info!("[BENCHMARK]: job {job_id} calibrated to effective {total}");
                }
                decide_rule_splitting(state, &job, total, result.speed).await;
            }
            Err(db_error) => error!("[BENCHMARK]: job lookup failed: {db_error}"),
        }
    }

    if let Err(db_error) = benchmarks.complete_request(result.request_id).await {
        error!("[BENCHMARK]: request completion failed: {db_error}");
    }
}

/// The rule-splitting decision is deferred until the first accurate speed.
async fn decide_rule_splitting(state: &AppState, job: &JobExecution, effective: u64, speed: u64) {
    if job.uses_rule_splitting || job.multiplication_factor <= 1 || speed == 0 {
        return;
    }
    let settings = SettingsRepository::new(state.db.clone());
    let enabled = settings.get_bool(setting_keys::RULE_SPLIT_ENABLED).await.unwrap_or(true);
    if !enabled {
        return;
    }
    let threshold = settings.get_f64(setting_keys::RULE_SPLIT_THRESHOLD).await.unwrap_or(0.5);
    let min_rules = settings.get_u64(setting_keys::RULE_SPLIT_MIN_RULES).await.unwrap_or(10);
    let chunk_duration = settings.get_u64(setting_keys::DEFAULT_CHUNK_DURATION).await.unwrap_or(1200);

    let rule_count = job.multiplication_factor;
    if !should_split_rules(effective, speed, chunk_duration, threshold, min_rules, rule_count) {
        return;
    }
    let splits = split_count(effective, speed, chunk_duration, rule_count);
    let jobs = JobRepository::new(state.db.clone());
    match jobs.enable_rule_splitting(job.id, splits).await {
        Ok(true) => info!("[BENCHMARK]: job {} flagged for rule splitting into {splits}", job.id),
        Ok(false) => {}
        Err(db_error) => error!("[BENCHMARK]: rule split write failed: {db_error}"),
    }
}

async fn layer_sum(state: &AppState, job_id: Uuid) -> u64 {
    let jobs = JobRepository::new(state.db.clone());
    match jobs.layers_for_job(job_id).await {
        Ok(layers) => layers
            .iter()
            .map(|layer| layer.effective_keyspace.or(layer.base_keyspace).unwrap_or(0))
            .sum(),
        Err(db_error) => {
            error!("[BENCHMARK]: layer sum failed: {db_error}");
            0
        }
    }
}
