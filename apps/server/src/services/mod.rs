// [apps/server/src/services/mod.rs]
//! Background daemons and the domain operations the session layer calls
//! into. One module per responsibility; daemons follow the spawn-a-loop
//! shape throughout.

pub mod benchmark;
pub mod completion;
pub mod cracks;
pub mod materials;
pub mod offline;
pub mod progress;
pub mod regen;
pub mod scheduler;
pub mod tasks;

use std::time::Duration;

use tracing::info;

use crate::state::AppState;

/// Housekeeping loop for the in-memory maps: retransmit collections idle
/// past their TTL and completion-cache entries past theirs.
pub fn spawn_state_pruners(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            let dropped_collections = state.retransmit.prune_idle();
            let dropped_completions = state.completion_cache.prune();
            if dropped_collections + dropped_completions > 0 {
                info!(
                    "[PRUNER]: dropped {dropped_collections} idle retransmit collections, {dropped_completions} stale completions"
                );
            }
        }
    });
}
