// [apps/server/src/handlers/session.rs]
//! Per-agent WebSocket session: read loop, serialized write loop, worker
//! task, heartbeat, and the disconnect bookkeeping (reconnect parking plus
//! the offline grace timer).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Extension;
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use krakenhashes_db::repositories::settings as setting_keys;
use krakenhashes_db::repositories::{
    AgentRepository, OfflineRepository, SettingsRepository, TaskRepository,
};
use krakenhashes_models::messages::{
    Envelope, FileSyncRequestPayload, MessageType, StateSyncRequestPayload, MAX_MESSAGE_BYTES,
};
use krakenhashes_models::{Agent, AgentStatus};

use crate::handlers::dispatch;
use crate::state::AppState;

/// Worker queue depth between the read loop and the dispatch worker.
const WORKER_QUEUE_CAPACITY: usize = 256;
/// Offline notification grace in seconds, shared with the disconnect
/// parking window.
const OFFLINE_GRACE_SECS: i64 = 120;

/// HTTP → WebSocket upgrade. The auth middleware already resolved the
/// agent from its headers.
pub async fn upgrade_agent_session(
    websocket_upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> impl IntoResponse {
    debug!("[SESSION]: upgrade negotiated for agent {}", agent.id);
    websocket_upgrade
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_agent_session(socket, state, agent))
}

#[instrument(skip(socket, state, agent), fields(agent = agent.id))]
async fn handle_agent_session(socket: WebSocket, state: AppState, agent: Agent) {
    let agent_id = agent.id;
    let (mut sink, mut stream) = socket.split();

    let settings = SettingsRepository::new(state.db.clone());
    let ping_period = Duration::from_secs(
        settings.get_u64(setting_keys::AGENT_PING_PERIOD_SECONDS).await.unwrap_or(54),
    );
    let pong_wait = Duration::from_secs(
        settings.get_u64(setting_keys::AGENT_PONG_WAIT_SECONDS).await.unwrap_or(60),
    );

    // Registration: link, online status, reconnect cancellation.
    let mut outbound = state.connections.register(agent_id);
    let agents = AgentRepository::new(state.db.clone());
    if let Err(db_error) = agents.set_status(agent_id, AgentStatus::Online).await {
        error!("[SESSION]: online status write failed: {db_error}");
    }
    let offline = OfflineRepository::new(state.db.clone());
    if let Err(db_error) = offline.record_reconnect(agent_id).await {
        error!("[SESSION]: reconnect record failed: {db_error}");
    }
    info!("[SESSION]: agent {agent_id} connected");

    // Pong accounting shared between read and write halves.
    let last_pong = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));

    // Worker: sequential dispatch keeps per-agent ordering while the read
    // loop stays constant-time.
    let (work_sender, mut work_receiver) = mpsc::channel::<Envelope>(WORKER_QUEUE_CAPACITY);
    let worker_state = state.clone();
    let worker_task = tokio::spawn(async move {
        while let Some(envelope) = work_receiver.recv().await {
            dispatch::handle(&worker_state, agent_id, envelope).await;
        }
    });

    // Write half: the single owner of the sink; heartbeat rides here.
    let pong_for_writer = Arc::clone(&last_pong);
    let mut write_task = tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(ping_period);
        ping_ticker.tick().await;
        loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    let since_pong = {
                        let last = pong_for_writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        last.elapsed()
                    };
                    if since_pong > ping_period + pong_wait {
                        warn!("[SESSION]: agent {agent_id} missed its pong window");
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                envelope = outbound.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let encoded = match envelope.encode() {
                                Ok(encoded) => encoded,
                                Err(encode_error) => {
                                    warn!("[SESSION]: encode failed: {encode_error}");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(encoded)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Kick off the file-sync conversation for this connection.
    if let Ok(request) = Envelope::new(MessageType::FileSyncRequest, &FileSyncRequestPayload {}) {
        if let Err(send_error) = state.connections.send(agent_id, request).await {
            warn!("[SESSION]: file_sync_request send failed: {send_error}");
        }
    }

    // Probe the agent's task state so chunks stuck in reconnect_pending get
    // reconciled even if the agent's own announcement was lost.
    let sync_probe = StateSyncRequestPayload { request_id: uuid::Uuid::new_v4() };
    if let Ok(request) = Envelope::new(MessageType::StateSyncRequest, &sync_probe) {
        if let Err(send_error) = state.connections.send(agent_id, request).await {
            warn!("[SESSION]: state_sync_request send failed: {send_error}");
        }
    }

    // Read half: constant-time routing only.
    let pong_for_reader = Arc::clone(&last_pong);
    let mut read_task = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Pong(_)) => {
                    let mut last =
                        pong_for_reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    *last = tokio::time::Instant::now();
                }
                Ok(Message::Text(raw)) => match Envelope::decode(&raw) {
                    Ok(envelope) => {
                        if work_sender.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(protocol_error) => {
                        // Log and drop; a malformed message never closes
                        // the connection.
                        warn!("[SESSION]: undecodable message from {agent_id}: {protocol_error}");
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(read_error) => {
                    debug!("[SESSION]: read error from {agent_id}: {read_error}");
                    break;
                }
            }
        }
    });

    // First finished half tears the session down.
    tokio::select! {
        _ = (&mut read_task) => {
            write_task.abort();
        }
        _ = (&mut write_task) => {
            read_task.abort();
        }
    }
    worker_task.abort();
    drop(worker_task);

    // Disconnect bookkeeping: unlink, park live chunks, start the offline
    // grace window.
    state.connections.unregister(agent_id);
    if let Err(db_error) = agents.set_status(agent_id, AgentStatus::Offline).await {
        error!("[SESSION]: offline status write failed: {db_error}");
    }

    let tasks = TaskRepository::new(state.db.clone());
    match tasks.park_for_reconnect(agent_id).await {
        Ok(parked) if !parked.is_empty() => {
            info!("[SESSION]: parked {} chunks of agent {agent_id}", parked.len());
        }
        Ok(_) => {}
        Err(db_error) => error!("[SESSION]: reconnect parking failed: {db_error}"),
    }

    let grace = chrono::Duration::seconds(OFFLINE_GRACE_SECS);
    if let Err(db_error) = offline.record_disconnect(agent_id, Utc::now(), grace).await {
        error!("[SESSION]: disconnect record failed: {db_error}");
    }
    info!("[SESSION]: agent {agent_id} disconnected");
}
