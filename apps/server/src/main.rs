// [apps/server/src/main.rs]
//! Server shell: environment, observability, kernel ignition.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use krakenhashes_server::kernel::ServerKernel;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    krakenhashes_telemetry::init_tracing("krakenhashes_server");

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "krakenhashes.db".to_string());
    let database_token = std::env::var("DATABASE_AUTH_TOKEN").ok();
    let files_root = std::env::var("KH_FILES_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("files"));
    let listen_port: u16 = std::env::var("KH_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(31337);

    info!("[SHELL]: KrakenHashes server starting on port {listen_port}");

    let kernel = ServerKernel::ignite(&database_url, database_token, files_root, listen_port).await?;
    kernel.launch().await
}
