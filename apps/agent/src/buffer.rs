// [apps/agent/src/buffer.rs]
//! Disk-backed disconnect buffer. While the session is down, messages worth
//! preserving are appended here; after a reconnect they are replayed and
//! pruned only once the server acknowledges their ids.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use krakenhashes_models::messages::{BufferedEntry, Envelope};

/// Best-effort bounds; the buffer is not a durable broker.
const MAX_ENTRIES: usize = 512;
const MAX_TOTAL_BYTES: u64 = 8 * 1024 * 1024;

pub struct DiskBuffer {
    directory: PathBuf,
    /// Serializes append/prune against replay scans.
    io_lock: Mutex<()>,
}

impl DiskBuffer {
    pub fn new(directory: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory, io_lock: Mutex::new(()) })
    }

    /// Appends one envelope if it is worth preserving. Oldest entries are
    /// evicted past the bounds.
    pub fn preserve(&self, envelope: &Envelope) {
        if !envelope.message_type.is_buffer_candidate() || !envelope.carries_crack_information() {
            return;
        }
        let _guard = self.io_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let entry = BufferedEntry {
            message_id: format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4()),
            message_type: envelope.message_type,
            payload: envelope.payload.clone(),
            created_at: envelope.timestamp,
        };

        let path = self.directory.join(format!("{}.json", entry.message_id));
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(error) = std::fs::write(&path, bytes) {
                    warn!("[BUFFER]: preserve failed for {}: {error}", entry.message_id);
                    return;
                }
                debug!("[BUFFER]: preserved {} ({})", entry.message_id, entry.message_type.as_str());
            }
            Err(error) => {
                warn!("[BUFFER]: serialization failed: {error}");
                return;
            }
        }

        self.enforce_bounds();
    }

    /// All preserved entries, oldest first, for the replay envelope.
    pub fn load_all(&self) -> Vec<BufferedEntry> {
        let _guard = self.io_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries = Vec::new();
        let Ok(dir) = std::fs::read_dir(&self.directory) else {
            return entries;
        };
        for file in dir.flatten() {
            if file.path().extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(file.path())
                .ok()
                .and_then(|bytes| serde_json::from_slice::<BufferedEntry>(&bytes).ok())
            {
                Some(entry) => entries.push(entry),
                None => {
                    // A torn write from a crash; drop it rather than poison
                    // every future replay.
                    warn!("[BUFFER]: discarding unreadable entry {:?}", file.file_name());
                    let _ = std::fs::remove_file(file.path());
                }
            }
        }
        entries.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        entries
    }

    /// Removes entries the server acknowledged.
    pub fn prune(&self, message_ids: &[String]) {
        let _guard = self.io_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in message_ids {
            let path = self.directory.join(format!("{id}.json"));
            if let Err(error) = std::fs::remove_file(&path) {
                debug!("[BUFFER]: prune miss for {id}: {error}");
            }
        }
    }

    pub fn len(&self) -> usize {
        std::fs::read_dir(&self.directory)
            .map(|dir| dir.flatten().count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_bounds(&self) {
        let Ok(dir) = std::fs::read_dir(&self.directory) else { return };
        let mut files: Vec<(PathBuf, u64)> = dir
            .flatten()
            .filter_map(|entry| {
                let size = entry.metadata().ok()?.len();
                Some((entry.path(), size))
            })
            .collect();
        // Message ids sort chronologically (millis prefix).
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let total: u64 = files.iter().map(|(_, size)| size).sum();
        let mut over_bytes = total.saturating_sub(MAX_TOTAL_BYTES);
        let mut over_count = files.len().saturating_sub(MAX_ENTRIES);

        for (path, size) in files {
            if over_bytes == 0 && over_count == 0 {
                break;
            }
            warn!("[BUFFER]: bound exceeded, dropping oldest entry {:?}", path.file_name());
            let _ = std::fs::remove_file(&path);
            over_bytes = over_bytes.saturating_sub(size);
            over_count = over_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krakenhashes_models::messages::{CrackBatchPayload, MessageType};

    fn crack_envelope() -> Envelope {
        Envelope::new(
            MessageType::CrackBatch,
            &CrackBatchPayload {
                task_id: Uuid::new_v4(),
                is_retransmit: false,
                cracked_hashes: vec![],
            },
        )
        .unwrap()
    }

    #[test]
    fn preserves_only_crack_bearing_messages() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DiskBuffer::new(dir.path().to_path_buf()).unwrap();

        buffer.preserve(&crack_envelope());
        assert_eq!(buffer.len(), 1);

        // A progress message with nothing cracked is not preserved.
        let quiet = Envelope::new(
            MessageType::JobProgress,
            &serde_json::json!({"task_id": Uuid::nil(), "cracked_count": 0}),
        )
        .unwrap();
        buffer.preserve(&quiet);
        assert_eq!(buffer.len(), 1);

        // A heartbeat is never preserved.
        let heartbeat = Envelope::new(MessageType::Heartbeat, &serde_json::json!({})).unwrap();
        buffer.preserve(&heartbeat);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn replay_round_trip_and_ack_prune() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DiskBuffer::new(dir.path().to_path_buf()).unwrap();

        buffer.preserve(&crack_envelope());
        buffer.preserve(&crack_envelope());

        let entries = buffer.load_all();
        assert_eq!(entries.len(), 2);

        // Server acks the first id only; one entry survives.
        buffer.prune(&[entries[0].message_id.clone()]);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.load_all()[0].message_id, entries[1].message_id);
    }
}
