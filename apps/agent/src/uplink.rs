// [apps/agent/src/uplink.rs]
//! Outbound message funnel. Producers never touch the socket: they submit
//! envelopes here, the session's write task drains the queue, and one lock
//! swap flips the funnel between connected and buffering modes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use krakenhashes_models::messages::Envelope;

use crate::buffer::DiskBuffer;

/// Outbound queue depth shared with the server side of the protocol.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("link is down")]
    Disconnected,
    #[error("outbound queue saturated")]
    QueueFull,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

pub struct Uplink {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    buffer: Arc<DiskBuffer>,
    write_wait: Duration,
}

impl Uplink {
    pub fn new(buffer: Arc<DiskBuffer>, write_wait: Duration) -> Self {
        Self { sender: Mutex::new(None), buffer, write_wait }
    }

    /// Installs the live queue for a fresh connection and returns its
    /// receiving end for the write task.
    pub fn attach(&self) -> mpsc::Receiver<Envelope> {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        *self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);
        receiver
    }

    /// Tears the queue down on disconnect; later sends fall through to the
    /// disk buffer.
    pub fn detach(&self) {
        *self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    fn current_sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Best-effort send. Queue saturation drops the message with a warning;
    /// a dead link routes crack-bearing messages to the disk buffer.
    pub fn send_async(&self, envelope: Envelope) {
        debug_assert!(
            envelope.message_type.is_drop_safe() || envelope.message_type.is_buffer_candidate(),
            "must-deliver tag {} sent through send_async",
            envelope.message_type.as_str()
        );
        match self.current_sender() {
            Some(sender) => match sender.try_send(envelope) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!(
                        "[UPLINK]: queue full, dropping {}",
                        dropped.message_type.as_str()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(orphan)) => {
                    self.buffer.preserve(&orphan);
                }
            },
            None => {
                self.buffer.preserve(&envelope);
                debug!("[UPLINK]: link down, message routed to buffer");
            }
        }
    }

    /// Must-deliver send: waits for queue room up to the write deadline and
    /// surfaces failure instead of dropping.
    pub async fn send(&self, envelope: Envelope) -> Result<(), UplinkError> {
        let Some(sender) = self.current_sender() else {
            self.buffer.preserve(&envelope);
            return Err(UplinkError::Disconnected);
        };
        match tokio::time::timeout(self.write_wait, sender.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(send_error)) => {
                self.buffer.preserve(&send_error.0);
                Err(UplinkError::Disconnected)
            }
            Err(_) => Err(UplinkError::Timeout(self.write_wait)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current_sender().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krakenhashes_models::messages::{CrackBatchPayload, MessageType};
    use uuid::Uuid;

    fn crack_envelope() -> Envelope {
        Envelope::new(
            MessageType::CrackBatch,
            &CrackBatchPayload { task_id: Uuid::new_v4(), is_retransmit: false, cracked_hashes: vec![] },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn disconnected_sends_preserve_crack_data() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DiskBuffer::new(dir.path().to_path_buf()).unwrap());
        let uplink = Uplink::new(buffer.clone(), Duration::from_millis(50));

        assert!(matches!(
            uplink.send(crack_envelope()).await,
            Err(UplinkError::Disconnected)
        ));
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn attached_sends_reach_the_write_queue() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(DiskBuffer::new(dir.path().to_path_buf()).unwrap());
        let uplink = Uplink::new(buffer.clone(), Duration::from_millis(50));

        let mut receiver = uplink.attach();
        uplink.send(crack_envelope()).await.unwrap();
        let delivered = receiver.recv().await.unwrap();
        assert_eq!(delivered.message_type, MessageType::CrackBatch);
        assert!(buffer.is_empty());

        uplink.detach();
        assert!(!uplink.is_connected());
    }
}
