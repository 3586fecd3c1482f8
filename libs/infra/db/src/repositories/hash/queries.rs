// [libs/infra/db/src/repositories/hash/queries.rs]
//! SQL statements for the deduplicated hash store and its hashlist joins.

pub const INSERT_HASH: &str = r#"
    INSERT INTO hashes (id, hash_value, original_line, username, domain, hash_type_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (hash_value) DO NOTHING
"#;

pub const SELECT_HASH_ID_BY_VALUE: &str = r#"
    SELECT id FROM hashes WHERE hash_value = ?1
"#;

pub const INSERT_HASHLIST: &str = r#"
    INSERT INTO hashlists (id, name, hash_type_id, total, original_file_path)
    VALUES (?1, ?2, ?3, ?4, ?5)
"#;

pub const LINK_HASH: &str = r#"
    INSERT INTO hashlist_hashes (hashlist_id, hash_id) VALUES (?1, ?2)
    ON CONFLICT DO NOTHING
"#;

pub const SELECT_HASHLIST: &str = r#"
    SELECT id, hash_type_id, total, cracked_count, file_md5,
           has_mixed_work_factors, original_file_path, updated_at
    FROM hashlists WHERE id = ?1
"#;

/// The crack write: only flips rows that are still uncracked, so
/// rows_affected is the honest count of newly cracked hashes.
pub const CRACK_BY_VALUE: &str = r#"
    UPDATE hashes
    SET is_cracked = 1, password = ?1, cracked_at = CURRENT_TIMESTAMP
    WHERE hash_value = ?2 AND is_cracked = 0
"#;

/// Per-task crack ledger keyed by the submitted value; the primary key makes
/// batch re-delivery idempotent.
pub const RECORD_TASK_CRACK: &str = r#"
    INSERT INTO task_cracks (task_id, hash_value, plain) VALUES (?1, ?2, ?3)
    ON CONFLICT (task_id, hash_value) DO NOTHING
"#;

pub const COUNT_TASK_CRACKS: &str = r#"
    SELECT COUNT(*) FROM task_cracks WHERE task_id = ?1
"#;

pub const SELECT_TASK_CRACK_VALUES: &str = r#"
    SELECT hash_value FROM task_cracks WHERE task_id = ?1
"#;

/// Counter maintenance: recomputed from the join so the count can never
/// drift past the number of linked cracked hashes.
pub const RECOMPUTE_HASHLIST_CRACKED: &str = r#"
    UPDATE hashlists
    SET cracked_count = (
            SELECT COUNT(*)
            FROM hashlist_hashes hh
            JOIN hashes h ON h.id = hh.hash_id
            WHERE hh.hashlist_id = hashlists.id AND h.is_cracked = 1
        ),
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?1
"#;

/// Deterministic order keeps the regenerated file's digest stable.
pub const SELECT_UNCRACKED_VALUES: &str = r#"
    SELECT h.hash_value
    FROM hashlist_hashes hh
    JOIN hashes h ON h.id = hh.hash_id
    WHERE hh.hashlist_id = ?1 AND h.is_cracked = 0
    ORDER BY h.hash_value
"#;

/// LM download variant: each distinct uncracked 16-char half once.
pub const SELECT_UNCRACKED_LM_HASHES: &str = r#"
    SELECT h.id, h.hash_value
    FROM hashlist_hashes hh
    JOIN hashes h ON h.id = hh.hash_id
    WHERE hh.hashlist_id = ?1 AND h.is_cracked = 0 AND h.hash_type_id = 3000
    ORDER BY h.hash_value
"#;

pub const SELECT_LM_CANDIDATES_FOR_HALF: &str = r#"
    SELECT id, hash_value FROM hashes
    WHERE hash_type_id = 3000 AND is_cracked = 0
      AND (substr(hash_value, 1, 16) = ?1 OR substr(hash_value, 17, 16) = ?1)
"#;

pub const UPSERT_LM_METADATA: &str = r#"
    INSERT INTO lm_metadata (hash_id) VALUES (?1)
    ON CONFLICT (hash_id) DO NOTHING
"#;

pub const SET_LM_FIRST_HALF: &str = r#"
    UPDATE lm_metadata
    SET first_half_cracked = 1, first_half_plain = ?1
    WHERE hash_id = ?2 AND first_half_cracked = 0
"#;

pub const SET_LM_SECOND_HALF: &str = r#"
    UPDATE lm_metadata
    SET second_half_cracked = 1, second_half_plain = ?1
    WHERE hash_id = ?2 AND second_half_cracked = 0
"#;

pub const SELECT_LM_METADATA: &str = r#"
    SELECT first_half_cracked, second_half_cracked, first_half_plain, second_half_plain
    FROM lm_metadata WHERE hash_id = ?1
"#;

pub const CRACK_BY_ID: &str = r#"
    UPDATE hashes
    SET is_cracked = 1, password = ?1, cracked_at = CURRENT_TIMESTAMP
    WHERE id = ?2 AND is_cracked = 0
"#;

pub const SET_HASHLIST_MD5: &str = r#"
    UPDATE hashlists SET file_md5 = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2
"#;

/// Drops the server's record of a synced hashlist file for every agent, so
/// the next sync sees a digest mismatch and re-downloads.
pub const INVALIDATE_AGENT_HASHLIST: &str = r#"
    DELETE FROM agent_files WHERE file_type = 'hashlist' AND name = ?1
"#;
