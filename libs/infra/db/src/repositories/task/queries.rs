// [libs/infra/db/src/repositories/task/queries.rs]
//! SQL statements for the task (chunk) lifecycle. Transitions carry their
//! origin states in the WHERE clause; rows_affected == 0 means the guard
//! lost and the caller must not proceed.

pub const INSERT_TASK: &str = r#"
    INSERT INTO job_tasks (
        id, job_id, layer_id, agent_id, status, keyspace_start, keyspace_end,
        effective_keyspace_start, effective_keyspace_end, is_keyspace_split,
        is_rule_split, rule_chunk_path, rule_start_index, rule_end_index
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
"#;

pub const SELECT_TASK: &str = r#"
    SELECT id, job_id, layer_id, agent_id, status, keyspace_start,
           keyspace_end, effective_keyspace_start, effective_keyspace_end,
           chunk_actual_keyspace, is_keyspace_split, is_rule_split,
           rule_chunk_path, rule_start_index, rule_end_index,
           expected_crack_count, received_crack_count,
           batches_complete_signaled, retry_count, retransmit_count,
           detailed_status, created_at, updated_at
    FROM job_tasks
"#;

pub const ASSIGN: &str = r#"
    UPDATE job_tasks
    SET status = 'assigned', agent_id = ?1, previous_agent_id = ?1,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2 AND status = 'pending'
"#;

pub const REVERT_ASSIGNMENT: &str = r#"
    UPDATE job_tasks
    SET status = 'pending', agent_id = NULL, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1 AND status = 'assigned'
"#;

/// First progress promotes assigned → running.
pub const PROMOTE_RUNNING: &str = r#"
    UPDATE job_tasks
    SET status = 'running', updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1 AND status = 'assigned'
"#;

pub const SET_PROCESSING: &str = r#"
    UPDATE job_tasks
    SET status = 'processing', expected_crack_count = ?1,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2 AND status IN ('assigned', 'running', 'reconnect_pending')
"#;

pub const UPDATE_EXPECTED_CRACKS: &str = r#"
    UPDATE job_tasks
    SET expected_crack_count = ?1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2
"#;

pub const ADD_RECEIVED_CRACKS: &str = r#"
    UPDATE job_tasks
    SET received_crack_count = received_crack_count + ?1,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2
"#;

pub const SIGNAL_BATCHES_COMPLETE: &str = r#"
    UPDATE job_tasks
    SET batches_complete_signaled = 1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1
"#;

pub const INCREMENT_RETRANSMITS: &str = r#"
    UPDATE job_tasks
    SET retransmit_count = retransmit_count + 1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1
"#;

pub const STORE_CHUNK_ACTUAL: &str = r#"
    UPDATE job_tasks
    SET chunk_actual_keyspace = ?1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2
"#;

pub const SET_EFFECTIVE_WINDOW: &str = r#"
    UPDATE job_tasks
    SET effective_keyspace_start = ?1, effective_keyspace_end = ?2,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?3
"#;

pub const SET_DETAILED_STATUS: &str = r#"
    UPDATE job_tasks
    SET detailed_status = ?1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2
"#;

/// Terminal transition plus agent release, one transaction at the call site.
pub const COMPLETE: &str = r#"
    UPDATE job_tasks
    SET status = ?1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2 AND status IN ('assigned', 'running', 'processing', 'reconnect_pending')
"#;

pub const RELEASE_AGENT: &str = r#"
    UPDATE agents
    SET busy = 0, current_task_id = NULL, current_job_id = NULL,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1 AND current_task_id = ?2
"#;

pub const OCCUPY_AGENT: &str = r#"
    UPDATE agents
    SET busy = 1, current_task_id = ?1, current_job_id = ?2,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?3 AND busy = 0
"#;

/// Disconnect parking: live chunks lose their agent but remember it.
pub const PARK_FOR_RECONNECT: &str = r#"
    UPDATE job_tasks
    SET status = 'reconnect_pending', previous_agent_id = agent_id,
        agent_id = NULL, updated_at = CURRENT_TIMESTAMP
    WHERE agent_id = ?1 AND status IN ('assigned', 'running')
"#;

pub const SELECT_PARKED_FOR_AGENT: &str = r#"
    SELECT id, retry_count FROM job_tasks
    WHERE previous_agent_id = ?1 AND status = 'reconnect_pending'
"#;

pub const SELECT_PARKED_EXPIRED: &str = r#"
    SELECT id FROM job_tasks
    WHERE status = 'reconnect_pending' AND updated_at < ?1
"#;

/// Reconnect reclaim: the same agent resumes the chunk it never stopped
/// working on.
pub const RECLAIM_PARKED: &str = r#"
    UPDATE job_tasks
    SET status = 'running', agent_id = ?1, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?2 AND status = 'reconnect_pending' AND previous_agent_id = ?1
"#;

pub const RESET_FOR_RETRY: &str = r#"
    UPDATE job_tasks
    SET status = 'pending', agent_id = NULL, retry_count = retry_count + 1,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1 AND status = 'reconnect_pending'
"#;

pub const FAIL_PERMANENTLY: &str = r#"
    UPDATE job_tasks
    SET status = 'failed', updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1
"#;

pub const SELECT_FOR_JOB: &str = r#"
    SELECT id, job_id, layer_id, agent_id, status, keyspace_start,
           keyspace_end, effective_keyspace_start, effective_keyspace_end,
           chunk_actual_keyspace, is_keyspace_split, is_rule_split,
           rule_chunk_path, rule_start_index, rule_end_index,
           expected_crack_count, received_crack_count,
           batches_complete_signaled, retry_count, retransmit_count,
           detailed_status, created_at, updated_at
    FROM job_tasks
    WHERE job_id = ?1
    ORDER BY created_at ASC, id ASC
"#;

pub const SELECT_LIVE_FOR_JOB: &str = r#"
    SELECT id, agent_id FROM job_tasks
    WHERE job_id = ?1 AND status IN ('assigned', 'running', 'processing')
"#;

pub const COUNT_FOR_JOB: &str = r#"
    SELECT COUNT(*) FROM job_tasks WHERE job_id = ?1
"#;
