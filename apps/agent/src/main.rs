// [apps/agent/src/main.rs]
//! Thin agent shell: parse directives, claim the data tree, wire the
//! runtime together, hand control to the session loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use krakenhashes_agent::buffer::DiskBuffer;
use krakenhashes_agent::config::{AgentConfig, AgentDirectives};
use krakenhashes_agent::executor::TaskRunner;
use krakenhashes_agent::router::AgentRuntime;
use krakenhashes_agent::session::Session;
use krakenhashes_agent::state::TaskBoard;
use krakenhashes_agent::sync::FileSyncManager;
use krakenhashes_agent::uplink::Uplink;
use krakenhashes_models::file::buffer_dir;
use krakenhashes_models::messages::{AgentShutdownPayload, Envelope, MessageType};
use krakenhashes_server_client::ServerClient;

/// Deadline for the shutdown notification before the process exits anyway.
const SHUTDOWN_NOTIFY_WAIT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    krakenhashes_telemetry::init_tracing("krakenhashes_agent");

    let directives = AgentDirectives::parse();
    let config = AgentConfig::from_directives(directives);

    // Claim the on-disk layout before anything else touches it.
    for subdir in ["wordlists", "rules", "binaries", "hashlists", "outfiles"] {
        std::fs::create_dir_all(config.data_dir().join(subdir))
            .with_context(|| format!("unable to create data subdirectory {subdir}"))?;
    }

    let server = Arc::new(ServerClient::new(
        &config.directives.server_url,
        config.directives.agent_id,
        &config.directives.api_key,
    )?);

    let buffer = Arc::new(DiskBuffer::new(buffer_dir(
        config.data_dir(),
        config.directives.agent_id,
    ))?);
    let uplink = Arc::new(Uplink::new(Arc::clone(&buffer), config.write_wait));
    let board = Arc::new(TaskBoard::new());

    let runtime = AgentRuntime {
        uplink: Arc::clone(&uplink),
        board: Arc::clone(&board),
        sync: Arc::new(FileSyncManager::new(
            config.data_dir().to_path_buf(),
            Arc::clone(&server),
        )),
        runner: Arc::new(TaskRunner::new(
            Arc::clone(&uplink),
            config.data_dir().to_path_buf(),
        )),
        server: Arc::clone(&server),
        buffer: Arc::clone(&buffer),
        data_dir: config.data_dir().to_path_buf(),
        debug: config.directives.debug,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let shutdown_uplink = Arc::clone(&uplink);
    let shutdown_board = Arc::clone(&board);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[SHELL]: termination requested, notifying server");
            shutdown_board.stop_any();
            let notice = AgentShutdownPayload { reason: "operator interrupt".to_string() };
            if let Ok(envelope) = Envelope::new(MessageType::AgentShutdown, &notice) {
                let _ = tokio::time::timeout(SHUTDOWN_NOTIFY_WAIT, shutdown_uplink.send(envelope)).await;
            }
            shutdown_flag.store(true, Ordering::SeqCst);
        }
    });

    info!(
        "[SHELL]: agent {} starting against {}",
        config.directives.agent_id, config.directives.server_url
    );

    Session::new(config, runtime, shutdown).run().await;

    info!("[SHELL]: agent offline");
    Ok(())
}
