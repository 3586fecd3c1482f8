// [libs/infra/db/src/repositories/job/queries.rs]
//! SQL statements for the job ledger. State guards live in the WHERE
//! clauses so every transition is a single atomic statement.

pub const INSERT_JOB: &str = r#"
    INSERT INTO job_executions (
        id, hashlist_id, attack_mode, hash_type, mask, wordlist_ids, rule_ids,
        assoc_wordlist_id, priority, max_agents, binary_pattern, status,
        base_keyspace, effective_keyspace, multiplication_factor,
        is_accurate_keyspace, uses_rule_splitting, rule_split_count,
        avg_rule_multiplier, increment_mode, increment_min, increment_max,
        dispatched_keyspace, processed_keyspace, completion_email_sent
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
              ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
"#;

pub const SELECT_JOB: &str = r#"
    SELECT id, hashlist_id, attack_mode, hash_type, mask, wordlist_ids,
           rule_ids, assoc_wordlist_id, priority, max_agents, binary_pattern,
           status, base_keyspace, effective_keyspace, multiplication_factor,
           is_accurate_keyspace, uses_rule_splitting, rule_split_count,
           avg_rule_multiplier, increment_mode, increment_min, increment_max,
           dispatched_keyspace, processed_keyspace, completion_email_sent,
           created_at, started_at
    FROM job_executions
"#;

/// Jobs the scheduler considers each cycle, oldest first inside a priority
/// band (FIFO is cross-band preserved by the priority sort).
pub const SELECT_SCHEDULABLE: &str = r#"
    SELECT id, hashlist_id, attack_mode, hash_type, mask, wordlist_ids,
           rule_ids, assoc_wordlist_id, priority, max_agents, binary_pattern,
           status, base_keyspace, effective_keyspace, multiplication_factor,
           is_accurate_keyspace, uses_rule_splitting, rule_split_count,
           avg_rule_multiplier, increment_mode, increment_min, increment_max,
           dispatched_keyspace, processed_keyspace, completion_email_sent,
           created_at, started_at
    FROM job_executions
    WHERE status IN ('pending', 'running')
    ORDER BY priority DESC, created_at ASC, id ASC
"#;

pub const COUNT_LIVE_TASKS: &str = r#"
    SELECT COUNT(*) FROM job_tasks
    WHERE job_id = ?1 AND status IN ('assigned', 'running', 'processing')
"#;

pub const SET_STATUS: &str = r#"
    UPDATE job_executions SET status = ?1 WHERE id = ?2
"#;

pub const MARK_STARTED: &str = r#"
    UPDATE job_executions
    SET status = 'running', started_at = COALESCE(started_at, CURRENT_TIMESTAMP)
    WHERE id = ?1
"#;

pub const CALIBRATE_KEYSPACE: &str = r#"
    UPDATE job_executions
    SET effective_keyspace = ?1, is_accurate_keyspace = 1,
        avg_rule_multiplier = COALESCE(?2, avg_rule_multiplier)
    WHERE id = ?3
"#;

pub const SET_EFFECTIVE_KEYSPACE: &str = r#"
    UPDATE job_executions SET effective_keyspace = ?1 WHERE id = ?2
"#;

pub const ENABLE_RULE_SPLITTING: &str = r#"
    UPDATE job_executions
    SET uses_rule_splitting = 1, rule_split_count = ?1
    WHERE id = ?2 AND uses_rule_splitting = 0
"#;

pub const ADD_DISPATCHED: &str = r#"
    UPDATE job_executions
    SET dispatched_keyspace = dispatched_keyspace + ?1
    WHERE id = ?2
"#;

pub const ROLL_BACK_DISPATCHED: &str = r#"
    UPDATE job_executions
    SET dispatched_keyspace = MAX(0, dispatched_keyspace - ?1)
    WHERE id = ?2
"#;

pub const SET_PROCESSED: &str = r#"
    UPDATE job_executions SET processed_keyspace = ?1 WHERE id = ?2
"#;

/// Completion view sync: pin both counters to processed so the rollup shows
/// 100% after an all-hashes-cracked shortcut.
pub const SYNC_KEYSPACE_TO_PROCESSED: &str = r#"
    UPDATE job_executions
    SET effective_keyspace = processed_keyspace,
        dispatched_keyspace = processed_keyspace
    WHERE id = ?1
"#;

pub const SELECT_FOR_HASHLIST: &str = r#"
    SELECT id, status FROM job_executions
    WHERE hashlist_id = ?1 AND status IN ('pending', 'running', 'paused')
"#;

pub const DELETE_JOB: &str = r#"
    DELETE FROM job_executions WHERE id = ?1 AND status = 'pending'
"#;

/// Guarded flag flip; rows_affected 0 means the email already went out.
pub const CLAIM_COMPLETION_EMAIL: &str = r#"
    UPDATE job_executions
    SET completion_email_sent = 1
    WHERE id = ?1 AND completion_email_sent = 0
"#;

// --- increment layers ---

pub const INSERT_LAYER: &str = r#"
    INSERT INTO increment_layers (
        id, job_id, mask_length, layer_mask, status, base_keyspace,
        effective_keyspace, is_accurate_keyspace, dispatched_keyspace,
        processed_keyspace
    ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, 0, 0, 0)
"#;

pub const SELECT_LAYERS: &str = r#"
    SELECT id, job_id, mask_length, layer_mask, status, base_keyspace,
           effective_keyspace, is_accurate_keyspace, dispatched_keyspace,
           processed_keyspace, started_at
    FROM increment_layers
    WHERE job_id = ?1
    ORDER BY mask_length
"#;

pub const CALIBRATE_LAYER: &str = r#"
    UPDATE increment_layers
    SET effective_keyspace = ?1, is_accurate_keyspace = 1
    WHERE id = ?2
"#;

pub const ADD_LAYER_DISPATCHED: &str = r#"
    UPDATE increment_layers
    SET dispatched_keyspace = dispatched_keyspace + ?1
    WHERE id = ?2
"#;

pub const ROLL_BACK_LAYER_DISPATCHED: &str = r#"
    UPDATE increment_layers
    SET dispatched_keyspace = MAX(0, dispatched_keyspace - ?1)
    WHERE id = ?2
"#;

pub const SET_LAYER_PROCESSED: &str = r#"
    UPDATE increment_layers SET processed_keyspace = ?1 WHERE id = ?2
"#;

pub const SET_LAYER_STATUS: &str = r#"
    UPDATE increment_layers SET status = ?1 WHERE id = ?2
"#;

pub const MARK_LAYER_STARTED: &str = r#"
    UPDATE increment_layers
    SET status = 'running', started_at = COALESCE(started_at, CURRENT_TIMESTAMP)
    WHERE id = ?1
"#;
