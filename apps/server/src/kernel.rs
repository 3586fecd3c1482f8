// [apps/server/src/kernel.rs]
//! Server kernel: database ignition, state construction, daemon launch,
//! and the HTTP listener.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use krakenhashes_db::repositories::SettingsRepository;
use krakenhashes_db::DbClient;

use crate::routes::create_router;
use crate::services;
use crate::state::AppState;

pub struct ServerKernel {
    pub listen_port: u16,
    pub state: AppState,
}

impl ServerKernel {
    /// Connects the database and builds shared state. Nothing else runs
    /// before the schema and settings are in place.
    pub async fn ignite(
        database_url: &str,
        database_token: Option<String>,
        files_root: PathBuf,
        listen_port: u16,
    ) -> anyhow::Result<Self> {
        let db = DbClient::connect(database_url, database_token)
            .await
            .context("database ignition failed")?;

        SettingsRepository::new(db.clone())
            .seed_defaults()
            .await
            .context("settings seed failed")?;

        tokio::fs::create_dir_all(files_root.join("hashlists")).await?;
        tokio::fs::create_dir_all(files_root.join("rules/chunks")).await?;

        Ok(Self {
            listen_port,
            state: AppState::new(db, files_root),
        })
    }

    /// Launches the background daemons and serves until the process dies.
    pub async fn launch(self) -> anyhow::Result<()> {
        let state = self.state.clone();

        services::scheduler::spawn_scheduler(state.clone());
        services::progress::spawn_progress_aggregator(state.clone());
        services::offline::spawn_offline_sweeper(state.clone());
        services::spawn_state_pruners(state.clone());

        let router = create_router(state);
        let address = SocketAddr::from(([0, 0, 0, 0], self.listen_port));
        info!("[KERNEL]: listening on {address}");

        let listener = tokio::net::TcpListener::bind(address)
            .await
            .with_context(|| format!("bind failed on {address}"))?;
        axum::serve(listener, router).await.context("server loop ended")?;
        Ok(())
    }
}
