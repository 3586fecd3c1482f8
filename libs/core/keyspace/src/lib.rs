// [libs/core/keyspace/src/lib.rs]
//! Pure keyspace arithmetic for the chunking engine.
//!
//! Nothing in this crate touches the database or the wire: the scheduler
//! feeds it measured speeds and counters and gets back chunk bounds. The one
//! exception is the rule-chunk file writer, which materializes a rule range
//! for an agent to download.

pub mod chunk;
pub mod increment;
pub mod refine;
pub mod rules;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyspaceError {
    #[error("malformed mask: {0}")]
    MalformedMask(String),
    #[error("rule range out of bounds: {start}..{end} of {total}")]
    RuleRangeOutOfBounds { start: u32, end: u32, total: u32 },
    #[error("rule chunk io failure: {0}")]
    RuleChunkIo(String),
}

pub use chunk::{plan_chunk, ChunkPlan, MIN_CHUNK_KEYSPACE};
pub use increment::{base_keyspace_for_mask, layer_masks, mask_token_count, truncate_mask};
pub use refine::{cascade_recompute, refine_rule_split, refine_single_task, CascadeChunk};
pub use rules::{rule_chunk_bounds, should_split_rules, split_count, write_rule_chunk};
