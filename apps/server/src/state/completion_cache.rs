// [apps/server/src/state/completion_cache.rs]
//! Completion idempotence cache. The first completion for a task id wins;
//! re-deliveries inside the TTL re-send the ACK without reprocessing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// How long a completion stays remembered.
pub const COMPLETION_TTL: Duration = Duration::from_secs(3600);

#[derive(Default)]
pub struct CompletionCache {
    completions: Mutex<HashMap<Uuid, Instant>>,
}

impl CompletionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once per task id within the TTL; the caller
    /// performs completion work only on true.
    pub fn first_completion(&self, task_id: Uuid) -> bool {
        let mut completions = self
            .completions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match completions.get(&task_id) {
            Some(recorded) if now.duration_since(*recorded) < COMPLETION_TTL => false,
            _ => {
                completions.insert(task_id, now);
                true
            }
        }
    }

    pub fn prune(&self) -> usize {
        let mut completions = self
            .completions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = completions.len();
        let now = Instant::now();
        completions.retain(|_, recorded| now.duration_since(*recorded) < COMPLETION_TTL);
        before - completions.len()
    }

    pub fn len(&self) -> usize {
        self.completions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_completions_are_dropped() {
        let cache = CompletionCache::new();
        let task = Uuid::new_v4();
        assert!(cache.first_completion(task));
        assert!(!cache.first_completion(task));
        assert!(!cache.first_completion(task));
        // A different task is unaffected.
        assert!(cache.first_completion(Uuid::new_v4()));
        assert_eq!(cache.len(), 2);
    }
}
