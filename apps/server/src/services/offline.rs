// [apps/server/src/services/offline.rs]
//! Agent-offline sweeper: a 60 s loop that turns expired grace windows into
//! a single notification each, then prunes old rows.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use krakenhashes_db::repositories::OfflineRepository;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn_offline_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        info!("[OFFLINE]: sweeper active every {SWEEP_INTERVAL:?}");
        loop {
            ticker.tick().await;
            sweep(&state).await;
        }
    });
}

async fn sweep(state: &AppState) {
    let offline = OfflineRepository::new(state.db.clone());
    let now = Utc::now();

    match offline.due_notifications(now).await {
        Ok(due) => {
            for agent_id in due {
                // The guarded flag flip keeps racing sweeps single-shot.
                match offline.mark_sent(agent_id).await {
                    Ok(true) => {
                        warn!("[NOTIFY]: agent {agent_id} offline past its grace period");
                    }
                    Ok(false) => {}
                    Err(db_error) => error!("[OFFLINE]: mark_sent failed: {db_error}"),
                }
            }
        }
        Err(db_error) => error!("[OFFLINE]: due scan failed: {db_error}"),
    }

    match offline.prune(now).await {
        Ok(0) => {}
        Ok(pruned) => info!("[OFFLINE]: pruned {pruned} stale rows"),
        Err(db_error) => error!("[OFFLINE]: prune failed: {db_error}"),
    }
}
