// [apps/server/src/state/connections.rs]
//! Live agent links. Each session registers one bounded outbound queue; the
//! session's write task is the only thing touching the socket, so producers
//! submit here and never serialize frames themselves.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use krakenhashes_models::messages::Envelope;

/// Outbound queue depth per agent.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 4096;
/// Default deadline for must-deliver sends.
pub const MUST_DELIVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SendError {
    #[error("agent {0} is not connected")]
    NotConnected(i64),
    #[error("outbound queue for agent {0} stayed full past the deadline")]
    Timeout(i64),
    #[error("link to agent {0} closed mid-send")]
    Closed(i64),
}

struct AgentLink {
    sender: mpsc::Sender<Envelope>,
}

#[derive(Default)]
pub struct ConnectionManager {
    links: RwLock<HashMap<i64, AgentLink>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the link for a fresh session, returning the queue's read
    /// end. An existing link for the same agent is displaced; its session
    /// will notice the closed queue and die.
    pub fn register(&self, agent_id: i64) -> mpsc::Receiver<Envelope> {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let mut links = self.links.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if links.insert(agent_id, AgentLink { sender }).is_some() {
            warn!("[LINKS]: displaced a previous session for agent {agent_id}");
        }
        receiver
    }

    pub fn unregister(&self, agent_id: i64) {
        let mut links = self.links.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        links.remove(&agent_id);
    }

    pub fn is_online(&self, agent_id: i64) -> bool {
        let links = self.links.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        links.contains_key(&agent_id)
    }

    pub fn online_agent_ids(&self) -> Vec<i64> {
        let links = self.links.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<i64> = links.keys().copied().collect();
        ids.sort();
        ids
    }

    fn sender_for(&self, agent_id: i64) -> Option<mpsc::Sender<Envelope>> {
        let links = self.links.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        links.get(&agent_id).map(|link| link.sender.clone())
    }

    /// Drop-safe send: queue saturation drops the message with a warning.
    pub fn send_async(&self, agent_id: i64, envelope: Envelope) {
        debug_assert!(
            envelope.message_type.is_drop_safe(),
            "must-deliver tag {} sent through send_async",
            envelope.message_type.as_str()
        );
        let Some(sender) = self.sender_for(agent_id) else {
            debug!("[LINKS]: agent {agent_id} offline, dropping {}", envelope.message_type.as_str());
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(dropped)) = sender.try_send(envelope) {
            warn!(
                "[LINKS]: queue full for agent {agent_id}, dropped {}",
                dropped.message_type.as_str()
            );
        }
    }

    /// Must-deliver send: waits for queue room up to the deadline and
    /// surfaces failure so the caller can revert state.
    pub async fn send(&self, agent_id: i64, envelope: Envelope) -> Result<(), SendError> {
        let sender = self
            .sender_for(agent_id)
            .ok_or(SendError::NotConnected(agent_id))?;
        match tokio::time::timeout(MUST_DELIVER_TIMEOUT, sender.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed(agent_id)),
            Err(_) => Err(SendError::Timeout(agent_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krakenhashes_models::messages::MessageType;

    fn heartbeat() -> Envelope {
        Envelope::new(MessageType::Heartbeat, &serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn register_send_unregister_round_trip() {
        let manager = ConnectionManager::new();
        assert!(!manager.is_online(7));

        let mut receiver = manager.register(7);
        assert!(manager.is_online(7));
        assert_eq!(manager.online_agent_ids(), vec![7]);

        manager.send_async(7, heartbeat());
        assert!(receiver.recv().await.is_some());

        manager.unregister(7);
        assert!(!manager.is_online(7));
        assert!(matches!(
            manager.send(7, heartbeat()).await,
            Err(SendError::NotConnected(7))
        ));
    }
}
