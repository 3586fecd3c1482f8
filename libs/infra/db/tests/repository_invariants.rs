// [libs/infra/db/tests/repository_invariants.rs]
//! Repository invariants exercised against an in-memory database.

use chrono::Utc;
use uuid::Uuid;

use krakenhashes_db::repositories::{
    AgentRepository, HashRepository, JobRepository, OfflineRepository, TaskRepository,
};
use krakenhashes_db::DbClient;
use krakenhashes_models::messages::CrackedHash;
use krakenhashes_models::{
    AttackMode, IncrementMode, JobExecution, JobStatus, JobTask, TaskStatus,
};

async fn memory_client() -> DbClient {
    DbClient::connect(":memory:", None).await.expect("in-memory database")
}

fn crack(hash: &str, plain: &str) -> CrackedHash {
    CrackedHash { hash: hash.to_string(), plain: plain.to_string(), crack_pos: None }
}

fn sample_job(hashlist_id: Uuid) -> JobExecution {
    JobExecution {
        id: Uuid::new_v4(),
        hashlist_id,
        attack_mode: AttackMode::BruteForce,
        hash_type: 1000,
        mask: Some("?l?l".into()),
        wordlist_ids: vec![],
        rule_ids: vec![],
        assoc_wordlist_id: None,
        priority: 0,
        max_agents: 1,
        binary_pattern: "default".into(),
        status: JobStatus::Pending,
        base_keyspace: Some(676),
        effective_keyspace: Some(676),
        multiplication_factor: 1,
        is_accurate_keyspace: false,
        uses_rule_splitting: false,
        rule_split_count: 0,
        avg_rule_multiplier: None,
        increment_mode: IncrementMode::Off,
        increment_min: None,
        increment_max: None,
        dispatched_keyspace: 0,
        processed_keyspace: 0,
        completion_email_sent: false,
        created_at: Utc::now(),
        started_at: None,
    }
}

fn sample_task(job_id: Uuid) -> JobTask {
    JobTask {
        id: Uuid::new_v4(),
        job_id,
        layer_id: None,
        agent_id: None,
        status: TaskStatus::Pending,
        keyspace_start: 0,
        keyspace_end: 676,
        effective_keyspace_start: Some(0),
        effective_keyspace_end: Some(676),
        chunk_actual_keyspace: None,
        is_keyspace_split: true,
        is_rule_split: false,
        rule_chunk_path: None,
        rule_start_index: None,
        rule_end_index: None,
        expected_crack_count: 0,
        received_crack_count: 0,
        batches_complete_signaled: false,
        retry_count: 0,
        retransmit_count: 0,
        detailed_status: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn busy_flag_tracks_exactly_one_live_task() {
    let client = memory_client().await;
    let agents = AgentRepository::new(client.clone());
    let jobs = JobRepository::new(client.clone());
    let tasks = TaskRepository::new(client.clone());
    let hashes = HashRepository::new(client.clone());

    let hashlist_id = Uuid::new_v4();
    hashes.create_hashlist(hashlist_id, "h", 1000, None).await.unwrap();
    let job = sample_job(hashlist_id);
    jobs.create(&job).await.unwrap();

    let agent_id = agents.register("rig-1", "key-1").await.unwrap();
    let task = sample_task(job.id);
    tasks.create(&task).await.unwrap();

    tasks.assign(task.id, job.id, agent_id).await.unwrap();
    let agent = agents.get(agent_id).await.unwrap();
    assert!(agent.busy);
    assert_eq!(agent.current_task_id, Some(task.id));

    // A second assignment to a busy agent must lose the guard.
    let second = sample_task(job.id);
    tasks.create(&second).await.unwrap();
    assert!(tasks.assign(second.id, job.id, agent_id).await.is_err());

    // Completing the task frees the agent in the same transaction.
    assert!(tasks.finish(task.id, Some(agent_id), TaskStatus::Completed).await.unwrap());
    let agent = agents.get(agent_id).await.unwrap();
    assert!(!agent.busy);
    assert_eq!(agent.current_task_id, None);
}

#[tokio::test]
async fn failed_send_revert_returns_task_to_pending() {
    let client = memory_client().await;
    let agents = AgentRepository::new(client.clone());
    let jobs = JobRepository::new(client.clone());
    let tasks = TaskRepository::new(client.clone());

    let job = sample_job(Uuid::new_v4());
    jobs.create(&job).await.unwrap();
    let agent_id = agents.register("rig-1", "key-1").await.unwrap();
    let task = sample_task(job.id);
    tasks.create(&task).await.unwrap();

    tasks.assign(task.id, job.id, agent_id).await.unwrap();
    tasks.revert_assignment(task.id, agent_id).await.unwrap();

    let task = tasks.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.agent_id, None);
    assert!(!agents.get(agent_id).await.unwrap().busy);
}

#[tokio::test]
async fn crack_batches_are_idempotent_and_propagate_across_hashlists() {
    let client = memory_client().await;
    let hashes = HashRepository::new(client.clone());

    // Two hashlists share the value "aa"; list one also holds "bb".
    let list_one = Uuid::new_v4();
    let list_two = Uuid::new_v4();
    hashes.create_hashlist(list_one, "one", 1000, None).await.unwrap();
    hashes.create_hashlist(list_two, "two", 1000, None).await.unwrap();
    hashes.add_hash(list_one, "aa", 1000, None, None).await.unwrap();
    hashes.add_hash(list_one, "bb", 1000, None, None).await.unwrap();
    hashes.add_hash(list_two, "aa", 1000, None, None).await.unwrap();

    let task_id = Uuid::new_v4();
    let batch = vec![crack("aa", "alpha"), crack("bb", "beta")];

    let outcome = hashes.apply_crack_batch(task_id, &batch).await.unwrap();
    assert_eq!(outcome.newly_cracked, 2);
    assert_eq!(outcome.recorded_for_task, 2);
    let mut affected = outcome.affected_hashlists.clone();
    affected.sort();
    let mut expected = vec![list_one, list_two];
    expected.sort();
    assert_eq!(affected, expected);

    // Cross-hashlist propagation: both lists saw their counters move.
    assert_eq!(hashes.get_hashlist(list_one).await.unwrap().cracked_count, 2);
    assert_eq!(hashes.get_hashlist(list_two).await.unwrap().cracked_count, 1);

    // Re-delivering the same batch adds nothing anywhere.
    let replay = hashes.apply_crack_batch(task_id, &batch).await.unwrap();
    assert_eq!(replay.newly_cracked, 0);
    assert_eq!(replay.recorded_for_task, 0);
    assert_eq!(hashes.cracked_count_for_task(task_id).await.unwrap(), 2);
    assert_eq!(hashes.get_hashlist(list_one).await.unwrap().cracked_count, 2);

    // The regenerated file must no longer contain cracked values.
    assert!(hashes.uncracked_values(list_one).await.unwrap().is_empty());
    assert!(hashes.uncracked_values(list_two).await.unwrap().is_empty());
}

#[tokio::test]
async fn lm_halves_complete_with_blank_auto_fill() {
    let client = memory_client().await;
    let hashes = HashRepository::new(client.clone());

    let list = Uuid::new_v4();
    hashes.create_hashlist(list, "lm", 3000, None).await.unwrap();
    // Second half is the blank constant: cracking the first half must fully
    // crack the hash.
    let value = format!("{}{}", "299bd128c1101fd6", "aad3b435b51404ee");
    hashes.add_hash(list, &value, 3000, None, None).await.unwrap();

    // The served halves contain the real half and the blank exactly once.
    let halves = hashes.uncracked_lm_halves(list).await.unwrap();
    assert_eq!(halves.len(), 2);
    assert!(halves.contains(&"299bd128c1101fd6".to_string()));
    assert!(halves.contains(&"aad3b435b51404ee".to_string()));

    let task_id = Uuid::new_v4();
    let outcome = hashes
        .apply_crack_batch(task_id, &[crack("299bd128c1101fd6", "PASSWO")])
        .await
        .unwrap();
    assert_eq!(outcome.newly_cracked, 1);
    assert_eq!(outcome.affected_hashlists, vec![list]);

    assert_eq!(hashes.get_hashlist(list).await.unwrap().cracked_count, 1);
    assert!(hashes.uncracked_lm_halves(list).await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_email_claim_fires_once() {
    let client = memory_client().await;
    let jobs = JobRepository::new(client.clone());
    let job = sample_job(Uuid::new_v4());
    jobs.create(&job).await.unwrap();

    assert!(jobs.claim_completion_email(job.id).await.unwrap());
    assert!(!jobs.claim_completion_email(job.id).await.unwrap());
}

#[tokio::test]
async fn disconnect_parks_tasks_and_reconnect_flow_retries() {
    let client = memory_client().await;
    let agents = AgentRepository::new(client.clone());
    let jobs = JobRepository::new(client.clone());
    let tasks = TaskRepository::new(client.clone());

    let job = sample_job(Uuid::new_v4());
    jobs.create(&job).await.unwrap();
    let agent_id = agents.register("rig-1", "key-1").await.unwrap();
    let task = sample_task(job.id);
    tasks.create(&task).await.unwrap();
    tasks.assign(task.id, job.id, agent_id).await.unwrap();

    let parked = tasks.park_for_reconnect(agent_id).await.unwrap();
    assert_eq!(parked, vec![task.id]);
    let parked_task = tasks.get(task.id).await.unwrap();
    assert_eq!(parked_task.status, TaskStatus::ReconnectPending);
    assert_eq!(parked_task.agent_id, None);
    assert!(!agents.get(agent_id).await.unwrap().busy);

    // The parked task is still attributed to its previous agent.
    let owned = tasks.parked_for_agent(agent_id).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].0, task.id);

    assert!(tasks.reset_for_retry(task.id).await.unwrap());
    let retried = tasks.get(task.id).await.unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test]
async fn offline_buffer_grace_and_cancel() {
    let client = memory_client().await;
    let offline = OfflineRepository::new(client.clone());
    let now = Utc::now();
    let grace = chrono::Duration::minutes(2);

    offline.record_disconnect(7, now, grace).await.unwrap();

    // Before the grace expires nothing is due.
    assert!(offline.due_notifications(now).await.unwrap().is_empty());
    // After the grace the agent is due exactly once.
    let later = now + chrono::Duration::minutes(3);
    assert_eq!(offline.due_notifications(later).await.unwrap(), vec![7]);
    assert!(offline.mark_sent(7).await.unwrap());
    assert!(!offline.mark_sent(7).await.unwrap());

    // A reconnect inside the grace cancels the notification.
    offline.record_disconnect(9, now, grace).await.unwrap();
    offline.record_reconnect(9).await.unwrap();
    assert!(offline.due_notifications(later).await.unwrap().is_empty());
}

#[tokio::test]
async fn keyspace_counters_respect_ordering_invariant() {
    let client = memory_client().await;
    let jobs = JobRepository::new(client.clone());
    let mut job = sample_job(Uuid::new_v4());
    job.effective_keyspace = Some(10_000);
    jobs.create(&job).await.unwrap();

    jobs.add_dispatched(job.id, 4_000).await.unwrap();
    jobs.set_processed(job.id, 2_500).await.unwrap();

    let stored = jobs.get(job.id).await.unwrap();
    assert!(stored.processed_keyspace <= stored.dispatched_keyspace);
    assert!(stored.dispatched_keyspace <= stored.effective_keyspace.unwrap());

    // Completion sync pins both counters to processed.
    jobs.sync_keyspace_to_processed(job.id).await.unwrap();
    let synced = jobs.get(job.id).await.unwrap();
    assert_eq!(synced.effective_keyspace, Some(2_500));
    assert_eq!(synced.dispatched_keyspace, 2_500);
}
