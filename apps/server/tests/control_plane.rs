// [apps/server/tests/control_plane.rs]
//! Control-plane scenarios against an in-memory database, with agent links
//! registered directly on the connection manager in place of sockets.

use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;

use krakenhashes_db::repositories::{
    AgentRepository, BenchmarkRepository, FileRepository, HashRepository, JobRepository,
    TaskRepository,
};
use krakenhashes_db::DbClient;
use krakenhashes_models::messages::{
    CrackBatchPayload, CrackBatchesCompletePayload, CrackedHash, MessageType,
    OutfileDeleteApprovedPayload, RequestCrackRetransmitPayload, TaskAssignmentPayload,
};
use krakenhashes_models::{
    AgentStatus, AttackMode, IncrementMode, JobExecution, JobStatus, SyncStatus, TaskStatus,
};
use krakenhashes_server::services::{cracks, scheduler};
use krakenhashes_server::state::AppState;

async fn test_state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = DbClient::connect(":memory:", None).await.expect("memory db");
    let state = AppState::new(db, dir.path().to_path_buf());
    (state, dir)
}

async fn online_agent(state: &AppState, name: &str, pattern: &str) -> i64 {
    let agents = AgentRepository::new(state.db.clone());
    let agent_id = agents.register(name, &format!("key-{name}")).await.unwrap();
    agents.set_status(agent_id, AgentStatus::Online).await.unwrap();
    agents.set_sync_status(agent_id, SyncStatus::Completed).await.unwrap();
    if pattern != "default" {
        // The registry stores the agent's pattern verbatim.
        let connection = state.db.connection().unwrap();
        connection
            .execute(
                "UPDATE agents SET binary_pattern = ?1 WHERE id = ?2",
                libsql::params![pattern, agent_id],
            )
            .await
            .unwrap();
    }
    agent_id
}

async fn register_binary(state: &AppState, version: &str) {
    let files = FileRepository::new(state.db.clone());
    files
        .register(
            &format!("hashcat-{version}.tar.gz"),
            None,
            krakenhashes_models::FileType::Binary,
            "d41d8cd98f00b204e9800998ecf8427e",
            1024,
            &format!("binaries/hashcat-{version}.tar.gz"),
            Some(version),
            None,
        )
        .await
        .unwrap();
}

async fn mask_job(state: &AppState, pattern: &str, priority: i32) -> JobExecution {
    let hashes = HashRepository::new(state.db.clone());
    let hashlist_id = Uuid::new_v4();
    hashes.create_hashlist(hashlist_id, "nt", 1000, None).await.unwrap();
    hashes.add_hash(hashlist_id, "8846f7eaee8fb117ad06bdd830b7586c", 1000, None, None).await.unwrap();

    let job = JobExecution {
        id: Uuid::new_v4(),
        hashlist_id,
        attack_mode: AttackMode::BruteForce,
        hash_type: 1000,
        mask: Some("?l?l".into()),
        wordlist_ids: vec![],
        rule_ids: vec![],
        assoc_wordlist_id: None,
        priority,
        max_agents: 1,
        binary_pattern: pattern.into(),
        status: JobStatus::Pending,
        base_keyspace: Some(676),
        effective_keyspace: Some(676),
        multiplication_factor: 1,
        is_accurate_keyspace: true,
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
    };
    JobRepository::new(state.db.clone()).create(&job).await.unwrap();
    job
}

async fn record_speed(state: &AppState, agent_id: i64) {
    BenchmarkRepository::new(state.db.clone())
        .record_speed(agent_id, AttackMode::BruteForce.as_u8(), 1000, None, 1_000_000)
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_assigns_whole_small_keyspace() {
    let (state, _dir) = test_state().await;
    register_binary(&state, "6.2.6").await;

    let agent_id = online_agent(&state, "rig-1", "default").await;
    record_speed(&state, agent_id).await;
    let mut link = state.connections.register(agent_id);

    let job = mask_job(&state, "default", 0).await;

    scheduler::run_cycle(&state).await.unwrap();

    let envelope = link.try_recv().expect("assignment delivered");
    assert_eq!(envelope.message_type, MessageType::TaskAssignment);
    let assignment: TaskAssignmentPayload = envelope.payload_as().unwrap();
    assert_eq!(assignment.job_execution_id, job.id);
    assert_eq!(assignment.keyspace_start, 0);
    assert_eq!(assignment.keyspace_end, 676);
    assert_eq!(assignment.output_format, "3");
    assert!(assignment.binary_path.starts_with("binaries/"));

    // Task row assigned, agent busy, dispatched accounted.
    let tasks = TaskRepository::new(state.db.clone());
    let rows = tasks.tasks_for_job(job.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TaskStatus::Assigned);
    assert_eq!(rows[0].agent_id, Some(agent_id));

    let agents = AgentRepository::new(state.db.clone());
    assert!(agents.get(agent_id).await.unwrap().busy);

    let jobs = JobRepository::new(state.db.clone());
    assert_eq!(jobs.get(job.id).await.unwrap().dispatched_keyspace, 676);
}

#[tokio::test]
async fn constrained_job_gets_the_specialist_agent() {
    let (state, _dir) = test_state().await;
    register_binary(&state, "6.2.6").await;
    register_binary(&state, "7.1.0").await;

    // Specialist runs only the 6 line; generalist runs anything.
    let specialist = online_agent(&state, "specialist", "6.2.6").await;
    let generalist = online_agent(&state, "generalist", "default").await;
    record_speed(&state, specialist).await;
    record_speed(&state, generalist).await;
    let mut specialist_link = state.connections.register(specialist);
    let mut generalist_link = state.connections.register(generalist);

    // Same priority band: the constrained job (6.x only) must be staffed
    // first, and with the least flexible agent.
    let constrained = mask_job(&state, "6.x", 0).await;
    let flexible = mask_job(&state, "default", 0).await;

    scheduler::run_cycle(&state).await.unwrap();

    let to_specialist: TaskAssignmentPayload = specialist_link
        .try_recv()
        .expect("specialist got work")
        .payload_as()
        .unwrap();
    assert_eq!(to_specialist.job_execution_id, constrained.id);

    let to_generalist: TaskAssignmentPayload = generalist_link
        .try_recv()
        .expect("generalist got work")
        .payload_as()
        .unwrap();
    assert_eq!(to_generalist.job_execution_id, flexible.id);
}

#[tokio::test]
async fn incompatible_agents_are_never_assigned() {
    let (state, _dir) = test_state().await;
    register_binary(&state, "7.1.0").await;

    let agent_id = online_agent(&state, "seven", "7.1.0").await;
    record_speed(&state, agent_id).await;
    let mut link = state.connections.register(agent_id);

    // Job demands the 6 line; the only agent runs 7.
    mask_job(&state, "6.x", 0).await;

    scheduler::run_cycle(&state).await.unwrap();
    assert!(link.try_recv().is_err(), "incompatible agent must stay idle");
}

fn crack(hash: &str, plain: &str) -> CrackedHash {
    CrackedHash { hash: hash.into(), plain: plain.into(), crack_pos: None }
}

/// Drives a task to `processing` with the given expectation, as the
/// job_status path would.
async fn processing_task(state: &AppState, agent_id: i64, expected: u64) -> (JobExecution, Uuid) {
    let job = mask_job(state, "default", 0).await;
    let tasks = TaskRepository::new(state.db.clone());
    let task = krakenhashes_models::JobTask {
        id: Uuid::new_v4(),
        job_id: job.id,
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
    };
    tasks.create(&task).await.unwrap();
    tasks.assign(task.id, job.id, agent_id).await.unwrap();
    tasks.enter_processing(task.id, agent_id, expected).await.unwrap();
    (job, task.id)
}

#[tokio::test]
async fn crack_pipeline_verifies_and_approves_deletion() {
    let (state, _dir) = test_state().await;
    let agent_id = online_agent(&state, "rig-1", "default").await;
    let mut link = state.connections.register(agent_id);
    let (_job, task_id) = processing_task(&state, agent_id, 3).await;

    // Seed the hashlist values the batch will crack.
    let hashes = HashRepository::new(state.db.clone());
    let jobs = JobRepository::new(state.db.clone());
    let job_row = jobs.schedulable().await.unwrap().pop().unwrap();
    for value in ["aa11", "bb22", "cc33"] {
        hashes.add_hash(job_row.hashlist_id, value, 1000, None, None).await.unwrap();
    }

    let batch = CrackBatchPayload {
        task_id,
        is_retransmit: false,
        cracked_hashes: vec![crack("aa11", "x"), crack("bb22", "y"), crack("cc33", "z")],
    };
    cracks::handle_crack_batch(&state, agent_id, batch).await;
    cracks::handle_batches_complete(
        &state,
        agent_id,
        CrackBatchesCompletePayload { task_id, is_retransmit: false },
    )
    .await;

    // Exact match: delete approval with the verified count, then the task
    // completes and the ACK goes out.
    let mut saw_approval = false;
    let mut saw_ack = false;
    while let Ok(envelope) = link.try_recv() {
        match envelope.message_type {
            MessageType::OutfileDeleteApproved => {
                let approval: OutfileDeleteApprovedPayload = envelope.payload_as().unwrap();
                assert_eq!(approval.expected_line_count, 3);
                assert!(approval.task_exists);
                saw_approval = true;
            }
            MessageType::TaskCompleteAck => saw_ack = true,
            _ => {}
        }
    }
    assert!(saw_approval, "delete approval expected");
    assert!(saw_ack, "completion ACK expected");

    let tasks = TaskRepository::new(state.db.clone());
    let finished = tasks.get(task_id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert!(finished.batches_complete_signaled);
    assert_eq!(hashes.cracked_count_for_task(task_id).await.unwrap(), 3);
}

#[tokio::test]
async fn short_delivery_triggers_retransmit_then_settles() {
    let (state, _dir) = test_state().await;
    let agent_id = online_agent(&state, "rig-1", "default").await;
    let mut link = state.connections.register(agent_id);
    let (_job, task_id) = processing_task(&state, agent_id, 3).await;

    let hashes = HashRepository::new(state.db.clone());
    let jobs = JobRepository::new(state.db.clone());
    let job_row = jobs.schedulable().await.unwrap().pop().unwrap();
    for value in ["aa11", "bb22", "cc33"] {
        hashes.add_hash(job_row.hashlist_id, value, 1000, None, None).await.unwrap();
    }

    // Only two of three cracks arrive before the completion marker.
    cracks::handle_crack_batch(
        &state,
        agent_id,
        CrackBatchPayload {
            task_id,
            is_retransmit: false,
            cracked_hashes: vec![crack("aa11", "x"), crack("bb22", "y")],
        },
    )
    .await;
    cracks::handle_batches_complete(
        &state,
        agent_id,
        CrackBatchesCompletePayload { task_id, is_retransmit: false },
    )
    .await;

    let mut retransmit: Option<RequestCrackRetransmitPayload> = None;
    while let Ok(envelope) = link.try_recv() {
        if envelope.message_type == MessageType::RequestCrackRetransmit {
            retransmit = Some(envelope.payload_as().unwrap());
        }
    }
    let retransmit = retransmit.expect("mismatch must request a retransmit");
    assert_eq!(retransmit.expected_count, 3);

    // The agent replays the whole outfile; duplicates are expected.
    cracks::handle_crack_batch(
        &state,
        agent_id,
        CrackBatchPayload {
            task_id,
            is_retransmit: true,
            cracked_hashes: vec![crack("aa11", "x"), crack("bb22", "y"), crack("cc33", "z")],
        },
    )
    .await;
    cracks::handle_batches_complete(
        &state,
        agent_id,
        CrackBatchesCompletePayload { task_id, is_retransmit: true },
    )
    .await;

    let mut saw_approval = false;
    while let Ok(envelope) = link.try_recv() {
        if envelope.message_type == MessageType::OutfileDeleteApproved {
            let approval: OutfileDeleteApprovedPayload = envelope.payload_as().unwrap();
            assert_eq!(approval.expected_line_count, 3);
            saw_approval = true;
        }
    }
    assert!(saw_approval);

    // Exactly three rows despite the duplicate re-delivery.
    assert_eq!(hashes.cracked_count_for_task(task_id).await.unwrap(), 3);
    let tasks = TaskRepository::new(state.db.clone());
    assert_eq!(tasks.get(task_id).await.unwrap().status, TaskStatus::Completed);
}
