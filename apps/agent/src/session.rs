// [apps/agent/src/session.rs]
//! The persistent server session: connect with backoff, split the socket
//! into read and write halves, keep the heartbeat alive, replay the disk
//! buffer, and reconcile state after every reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use krakenhashes_models::messages::{
    AgentStatusPayload, BufferedMessagesPayload, Envelope, MessageType, PendingOutfilesPayload,
};

use crate::config::AgentConfig;
use crate::hardware;
use crate::outfile::pending_outfile_tasks;
use crate::router::AgentRuntime;

/// Reconnect backoff: start, factor 2, cap.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// The agent's own periodic status report.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Session {
    config: AgentConfig,
    runtime: AgentRuntime,
    shutdown: Arc<AtomicBool>,
    started_at: std::time::Instant,
}

impl Session {
    pub fn new(config: AgentConfig, runtime: AgentRuntime, shutdown: Arc<AtomicBool>) -> Self {
        Self { config, runtime, shutdown, started_at: std::time::Instant::now() }
    }

    /// Runs until shutdown: connect, serve, back off, reconnect.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        let mut backoff = BACKOFF_INITIAL;
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.connect_and_serve().await {
                Ok(()) => {
                    // Orderly close; reconnect promptly but never hot-loop
                    // against a server that drops us straight away.
                    backoff = BACKOFF_INITIAL;
                    tokio::time::sleep(BACKOFF_INITIAL).await;
                }
                Err(session_error) => {
                    warn!("[SESSION]: link failed: {session_error}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
        info!("[SESSION]: shutdown flag observed, session loop ending");
    }

    async fn connect_and_serve(&mut self) -> anyhow::Result<()> {
        // Timing config is refetched on every connect so admin changes
        // apply at the next reconnect.
        match self.runtime.server.fetch_timing_config().await {
            Ok(timing) => self.config.apply_server_timing(&timing),
            Err(config_error) => {
                warn!("[SESSION]: timing config fetch failed, keeping previous values: {config_error}");
            }
        }

        let mut request = self.config.websocket_url().into_client_request()?;
        request.headers_mut().insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.directives.api_key)?,
        );
        request.headers_mut().insert(
            "x-agent-id",
            HeaderValue::from_str(&self.config.directives.agent_id.to_string())?,
        );

        let (socket, _response) = connect_async(request).await?;
        info!("[SESSION]: link established");
        let (mut sink, mut stream) = socket.split();

        // Control frames (pongs) bypass the envelope queue.
        let (control_sender, mut control_receiver) = mpsc::channel::<Message>(16);
        let mut outbound = self.runtime.uplink.attach();

        // Write half: the only place that touches the sink.
        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    control = control_receiver.recv() => {
                        match control {
                            Some(frame) => {
                                if sink.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
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

        self.announce_reconnect_state().await;

        // The agent's own periodic status pulse.
        let status_runtime = self.runtime.clone();
        let started_at = self.started_at;
        let status_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (active, _) = status_runtime.board.snapshot();
                let payload = AgentStatusPayload {
                    status: "online".to_string(),
                    active_task_id: active.map(|(task_id, _)| task_id),
                    uptime_seconds: started_at.elapsed().as_secs(),
                };
                if let Ok(envelope) = Envelope::new(MessageType::AgentStatus, &payload) {
                    status_runtime.uplink.send_async(envelope);
                }
            }
        });

        // Read loop: if the server goes quiet past ping period + pong wait,
        // the link is dead even without a TCP reset.
        let read_deadline = self.config.ping_period + self.config.pong_wait;
        let serve_result: anyhow::Result<()> = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            let frame = match tokio::time::timeout(read_deadline, stream.next()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(_) => break Err(anyhow::anyhow!("no server traffic for {read_deadline:?}")),
            };
            match frame {
                Ok(Message::Ping(payload)) => {
                    if control_sender.send(Message::Pong(payload)).await.is_err() {
                        break Err(anyhow::anyhow!("write half gone"));
                    }
                }
                Ok(Message::Text(raw)) => match Envelope::decode(&raw) {
                    Ok(envelope) => self.runtime.route(envelope),
                    Err(protocol_error) => {
                        // One bad message never costs the connection.
                        warn!("[SESSION]: undecodable message ignored: {protocol_error}");
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("[SESSION]: server closed the link");
                    break Ok(());
                }
                Ok(_) => {}
                Err(read_error) => break Err(read_error.into()),
            }
        };

        self.runtime.uplink.detach();
        status_task.abort();
        write_task.abort();
        serve_result
    }

    /// Post-connect reconciliation: hardware info, buffered replay, current
    /// task status, then pending outfiles, in that order, so the server
    /// sees our state before it reacts to our backlog.
    async fn announce_reconnect_state(&self) {
        let devices = hardware::detect_devices(self.config.directives.test_mode, None).await;
        let hardware_payload = krakenhashes_models::messages::HardwareInfoPayload {
            devices,
            os_info: std::env::consts::OS.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Ok(envelope) = Envelope::new(MessageType::HardwareInfo, &hardware_payload) {
            self.runtime.uplink.send_async(envelope);
        }

        let buffered = self.runtime.buffer.load_all();
        if !buffered.is_empty() {
            info!("[SESSION]: replaying {} buffered messages", buffered.len());
            let replay = BufferedMessagesPayload { messages: buffered };
            match Envelope::new(MessageType::BufferedMessages, &replay) {
                Ok(envelope) => {
                    if let Err(send_error) = self.runtime.uplink.send(envelope).await {
                        warn!("[SESSION]: buffered replay send failed: {send_error}");
                    }
                }
                Err(encode_error) => error!("[SESSION]: replay encode failed: {encode_error}"),
            }
        }

        let status = self.runtime.current_task_status();
        if let Ok(envelope) = Envelope::new(MessageType::CurrentTaskStatus, &status) {
            if let Err(send_error) = self.runtime.uplink.send(envelope).await {
                warn!("[SESSION]: current_task_status send failed: {send_error}");
            }
        }

        let mut pending = pending_outfile_tasks(&self.config.directives.data_dir);
        let (active, _) = self.runtime.board.snapshot();
        let current_task_id = active.map(|(task_id, _)| task_id);
        if let Some(current) = current_task_id {
            pending.retain(|task_id| *task_id != current);
        }
        if !pending.is_empty() || current_task_id.is_some() {
            let payload = PendingOutfilesPayload { task_ids: pending, current_task_id };
            if let Ok(envelope) = Envelope::new(MessageType::PendingOutfiles, &payload) {
                if let Err(send_error) = self.runtime.uplink.send(envelope).await {
                    warn!("[SESSION]: pending_outfiles send failed: {send_error}");
                }
            }
        }
        debug!("[SESSION]: reconnect state announced");
    }
}
