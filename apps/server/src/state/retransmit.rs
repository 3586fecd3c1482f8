// [apps/server/src/state/retransmit.rs]
//! Retransmit collection state. Incoming retransmit batches are collected,
//! not applied: the whole set is deduplicated against the database in one
//! pass when the terminating `crack_batches_complete` arrives.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use krakenhashes_models::messages::CrackedHash;

/// Collections idle past this are dropped by the pruner.
pub const COLLECTION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

struct Collection {
    cracks: Vec<CrackedHash>,
    last_touched: Instant,
}

#[derive(Default)]
pub struct RetransmitCollections {
    collections: Mutex<HashMap<Uuid, Collection>>,
}

impl RetransmitCollections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, task_id: Uuid, mut batch: Vec<CrackedHash>) {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = collections
            .entry(task_id)
            .or_insert_with(|| Collection { cracks: Vec::new(), last_touched: Instant::now() });
        entry.cracks.append(&mut batch);
        entry.last_touched = Instant::now();
    }

    /// Takes the whole collection for the one-shot dedup pass.
    pub fn take(&self, task_id: Uuid) -> Vec<CrackedHash> {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        collections
            .remove(&task_id)
            .map(|collection| collection.cracks)
            .unwrap_or_default()
    }

    pub fn prune_idle(&self) -> usize {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = collections.len();
        let now = Instant::now();
        collections
            .retain(|_, collection| now.duration_since(collection.last_touched) < COLLECTION_IDLE_TTL);
        before - collections.len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crack(hash: &str) -> CrackedHash {
        CrackedHash { hash: hash.into(), plain: "x".into(), crack_pos: None }
    }

    #[test]
    fn collects_across_batches_and_takes_once() {
        let collections = RetransmitCollections::new();
        let task = Uuid::new_v4();

        collections.append(task, vec![crack("aa"), crack("bb")]);
        collections.append(task, vec![crack("cc")]);
        assert_eq!(collections.pending_tasks(), 1);

        let taken = collections.take(task);
        assert_eq!(taken.len(), 3);
        assert!(collections.take(task).is_empty());
        assert_eq!(collections.pending_tasks(), 0);
    }
}
