// [apps/server/src/state/mod.rs]
//! Application state: one owner per shared map, everything else reaches it
//! through this handle. Entities reference each other by id only.

pub mod completion_cache;
pub mod connections;
pub mod progress;
pub mod retransmit;

use std::path::PathBuf;
use std::sync::Arc;

use krakenhashes_db::DbClient;

pub use completion_cache::CompletionCache;
pub use connections::{ConnectionManager, SendError};
pub use progress::{ProgressMap, TaskProgressSnapshot};
pub use retransmit::RetransmitCollections;

#[derive(Clone)]
pub struct AppState {
    pub db: DbClient,
    pub connections: Arc<ConnectionManager>,
    pub retransmit: Arc<RetransmitCollections>,
    pub completion_cache: Arc<CompletionCache>,
    pub progress: Arc<ProgressMap>,
    /// Root of server-side file storage (wordlists, rules, binaries,
    /// regenerated hashlist files).
    pub files_root: PathBuf,
}

impl AppState {
    pub fn new(db: DbClient, files_root: PathBuf) -> Self {
        Self {
            db,
            connections: Arc::new(ConnectionManager::new()),
            retransmit: Arc::new(RetransmitCollections::new()),
            completion_cache: Arc::new(CompletionCache::new()),
            progress: Arc::new(ProgressMap::new()),
            files_root,
        }
    }
}
