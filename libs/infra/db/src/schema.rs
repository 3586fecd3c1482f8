// [libs/infra/db/src/schema.rs]
//! Idempotent schema bootstrap. Every table is `CREATE TABLE IF NOT EXISTS`
//! so hot re-deploys and in-memory test databases share one code path.

use libsql::Connection;
use tracing::debug;

use crate::errors::DbError;

const TABLES: &[(&str, &str)] = &[
    ("agents", r#"
        CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            binary_pattern TEXT NOT NULL DEFAULT 'default',
            enabled INTEGER NOT NULL DEFAULT 1,
            busy INTEGER NOT NULL DEFAULT 0,
            current_task_id TEXT,
            current_job_id TEXT,
            extra_parameters TEXT NOT NULL DEFAULT '',
            sync_status TEXT NOT NULL DEFAULT 'pending',
            status TEXT NOT NULL DEFAULT 'offline',
            last_seen_at DATETIME,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
    "#),
    ("agent_devices", r#"
        CREATE TABLE IF NOT EXISTS agent_devices (
            agent_id INTEGER NOT NULL,
            device_id INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            device_type TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (agent_id, device_id)
        );
    "#),
    ("agent_files", r#"
        CREATE TABLE IF NOT EXISTS agent_files (
            agent_id INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            name TEXT NOT NULL,
            md5 TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            synced_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (agent_id, file_type, name)
        );
    "#),
    ("files", r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            category TEXT,
            file_type TEXT NOT NULL,
            md5 TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            server_path TEXT NOT NULL,
            binary_version TEXT,
            rule_count INTEGER,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (file_type, name)
        );
    "#),
    ("hashes", r#"
        CREATE TABLE IF NOT EXISTS hashes (
            id TEXT PRIMARY KEY,
            hash_value TEXT NOT NULL UNIQUE,
            original_line TEXT,
            username TEXT,
            domain TEXT,
            hash_type_id INTEGER NOT NULL,
            is_cracked INTEGER NOT NULL DEFAULT 0,
            password TEXT,
            cracked_at DATETIME
        );
    "#),
    ("hashlists", r#"
        CREATE TABLE IF NOT EXISTS hashlists (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            hash_type_id INTEGER NOT NULL,
            total INTEGER NOT NULL DEFAULT 0,
            cracked_count INTEGER NOT NULL DEFAULT 0,
            file_md5 TEXT,
            has_mixed_work_factors INTEGER NOT NULL DEFAULT 0,
            original_file_path TEXT,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
    "#),
    ("hashlist_hashes", r#"
        CREATE TABLE IF NOT EXISTS hashlist_hashes (
            hashlist_id TEXT NOT NULL,
            hash_id TEXT NOT NULL,
            PRIMARY KEY (hashlist_id, hash_id)
        );
    "#),
    ("lm_metadata", r#"
        CREATE TABLE IF NOT EXISTS lm_metadata (
            hash_id TEXT PRIMARY KEY,
            first_half_cracked INTEGER NOT NULL DEFAULT 0,
            second_half_cracked INTEGER NOT NULL DEFAULT 0,
            first_half_plain TEXT,
            second_half_plain TEXT
        );
    "#),
    ("linked_hashlists", r#"
        CREATE TABLE IF NOT EXISTS linked_hashlists (
            hashlist_a TEXT NOT NULL,
            hashlist_b TEXT NOT NULL,
            link_type TEXT NOT NULL DEFAULT 'duplicate',
            PRIMARY KEY (hashlist_a, hashlist_b)
        );
    "#),
    ("job_executions", r#"
        CREATE TABLE IF NOT EXISTS job_executions (
            id TEXT PRIMARY KEY,
            hashlist_id TEXT NOT NULL,
            attack_mode INTEGER NOT NULL,
            hash_type INTEGER NOT NULL,
            mask TEXT,
            wordlist_ids TEXT NOT NULL DEFAULT '[]',
            rule_ids TEXT NOT NULL DEFAULT '[]',
            assoc_wordlist_id INTEGER,
            priority INTEGER NOT NULL DEFAULT 0,
            max_agents INTEGER NOT NULL DEFAULT 0,
            binary_pattern TEXT NOT NULL DEFAULT 'default',
            status TEXT NOT NULL DEFAULT 'pending',
            base_keyspace INTEGER,
            effective_keyspace INTEGER,
            multiplication_factor INTEGER NOT NULL DEFAULT 1,
            is_accurate_keyspace INTEGER NOT NULL DEFAULT 0,
            uses_rule_splitting INTEGER NOT NULL DEFAULT 0,
            rule_split_count INTEGER NOT NULL DEFAULT 0,
            avg_rule_multiplier REAL,
            increment_mode TEXT NOT NULL DEFAULT 'off',
            increment_min INTEGER,
            increment_max INTEGER,
            dispatched_keyspace INTEGER NOT NULL DEFAULT 0,
            processed_keyspace INTEGER NOT NULL DEFAULT 0,
            completion_email_sent INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            started_at DATETIME
        );
    "#),
    ("increment_layers", r#"
        CREATE TABLE IF NOT EXISTS increment_layers (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            mask_length INTEGER NOT NULL,
            layer_mask TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            base_keyspace INTEGER,
            effective_keyspace INTEGER,
            is_accurate_keyspace INTEGER NOT NULL DEFAULT 0,
            dispatched_keyspace INTEGER NOT NULL DEFAULT 0,
            processed_keyspace INTEGER NOT NULL DEFAULT 0,
            started_at DATETIME,
            UNIQUE (job_id, mask_length)
        );
    "#),
    ("job_tasks", r#"
        CREATE TABLE IF NOT EXISTS job_tasks (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            layer_id TEXT,
            agent_id INTEGER,
            previous_agent_id INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            keyspace_start INTEGER NOT NULL DEFAULT 0,
            keyspace_end INTEGER NOT NULL DEFAULT 0,
            effective_keyspace_start INTEGER,
            effective_keyspace_end INTEGER,
            chunk_actual_keyspace INTEGER,
            is_keyspace_split INTEGER NOT NULL DEFAULT 0,
            is_rule_split INTEGER NOT NULL DEFAULT 0,
            rule_chunk_path TEXT,
            rule_start_index INTEGER,
            rule_end_index INTEGER,
            expected_crack_count INTEGER NOT NULL DEFAULT 0,
            received_crack_count INTEGER NOT NULL DEFAULT 0,
            batches_complete_signaled INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            retransmit_count INTEGER NOT NULL DEFAULT 0,
            detailed_status TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
    "#),
    ("task_cracks", r#"
        CREATE TABLE IF NOT EXISTS task_cracks (
            task_id TEXT NOT NULL,
            hash_value TEXT NOT NULL,
            plain TEXT NOT NULL DEFAULT '',
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (task_id, hash_value)
        );
    "#),
    ("agent_benchmarks", r#"
        CREATE TABLE IF NOT EXISTS agent_benchmarks (
            agent_id INTEGER NOT NULL,
            attack_mode INTEGER NOT NULL,
            hash_type INTEGER NOT NULL,
            salt_key INTEGER NOT NULL DEFAULT -1,
            speed INTEGER NOT NULL,
            measured_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (agent_id, attack_mode, hash_type, salt_key)
        );
    "#),
    ("benchmark_requests", r#"
        CREATE TABLE IF NOT EXISTS benchmark_requests (
            id TEXT PRIMARY KEY,
            agent_id INTEGER NOT NULL,
            job_id TEXT,
            layer_id TEXT,
            attack_mode INTEGER NOT NULL,
            hash_type INTEGER NOT NULL,
            salt_key INTEGER NOT NULL DEFAULT -1,
            forced INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            completed_at DATETIME
        );
    "#),
    ("settings", r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
    "#),
    ("agent_offline_buffer", r#"
        CREATE TABLE IF NOT EXISTS agent_offline_buffer (
            agent_id INTEGER PRIMARY KEY,
            disconnected_at DATETIME NOT NULL,
            notification_due_at DATETIME NOT NULL,
            sent INTEGER NOT NULL DEFAULT 0,
            reconnected INTEGER NOT NULL DEFAULT 0
        );
    "#),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_hashes_value ON hashes (hash_value);",
    "CREATE INDEX IF NOT EXISTS idx_hashlist_hashes_hash ON hashlist_hashes (hash_id);",
    "CREATE INDEX IF NOT EXISTS idx_tasks_job ON job_tasks (job_id);",
    "CREATE INDEX IF NOT EXISTS idx_tasks_agent_status ON job_tasks (agent_id, status);",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON job_tasks (status);",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON job_executions (status, priority);",
    "CREATE INDEX IF NOT EXISTS idx_benchmark_requests_status ON benchmark_requests (status);",
    "CREATE INDEX IF NOT EXISTS idx_task_cracks_task ON task_cracks (task_id);",
];

pub async fn apply_schema(connection: &Connection) -> Result<(), DbError> {
    for (label, ddl) in TABLES {
        connection
            .execute(ddl, ())
            .await
            .map_err(|error| DbError::Connection(format!("schema {label}: {error}")))?;
        debug!("[SCHEMA]: ensured table {label}");
    }
    for ddl in INDEXES {
        connection
            .execute(ddl, ())
            .await
            .map_err(|error| DbError::Connection(format!("schema index: {error}")))?;
    }
    Ok(())
}
