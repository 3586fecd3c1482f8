// [apps/agent/src/outfile.rs]
//! Outfile monitoring and the crack-delivery pipeline's agent half.
//!
//! The cracker appends `hash:plain` lines to one outfile per task. A
//! streamer tails it, deduplicates, and ships batches upstream; the file is
//! deleted only when the server approves with an exact expected line count.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_models::file::outfile_path;
use krakenhashes_models::messages::{
    CrackBatchPayload, CrackBatchesCompletePayload, CrackedHash, Envelope, MessageType,
    OutfileDeleteApprovedPayload, OutfileDeleteRejectedPayload,
};

use crate::state::TaskBoard;
use crate::uplink::Uplink;

/// Flush when the pending batch reaches this many cracks…
pub const BATCH_FLUSH_SIZE: usize = 10_000;
/// …or when this much time has passed since the last flush.
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Parses one outfile line. The plain may itself contain `:`; only the
/// first separator splits.
pub fn parse_outfile_line(line: &str) -> Option<CrackedHash> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return None;
    }
    let (hash, plain) = trimmed.split_once(':')?;
    if hash.is_empty() {
        return None;
    }
    Some(CrackedHash { hash: hash.to_string(), plain: plain.to_string(), crack_pos: None })
}

/// Counts outfile lines the way the server counts expected cracks.
pub async fn count_outfile_lines(path: &Path) -> std::io::Result<u64> {
    let raw = fs::read_to_string(path).await?;
    Ok(raw.lines().filter(|line| !line.trim().is_empty()).count() as u64)
}

/// Task ids with an outfile still on disk; announced after every connect.
pub fn pending_outfile_tasks(data_dir: &Path) -> Vec<Uuid> {
    let dir = data_dir.join("outfiles");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut tasks: Vec<Uuid> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            let stem = name.strip_suffix(".out")?;
            Uuid::parse_str(stem).ok()
        })
        .collect();
    tasks.sort();
    tasks
}

/// Tails one task's outfile until the cracker is done and the tail is
/// drained, then signals `crack_batches_complete`.
pub struct OutfileStreamer {
    task_id: Uuid,
    path: PathBuf,
    uplink: Arc<Uplink>,
}

impl OutfileStreamer {
    pub fn new(task_id: Uuid, data_dir: &Path, uplink: Arc<Uplink>) -> Self {
        Self { task_id, path: outfile_path(data_dir, task_id), uplink }
    }

    /// Runs until `cracker_done` flips and the file is fully consumed.
    /// Returns the number of unique cracks shipped.
    #[instrument(skip(self, cracker_done), fields(task = %self.task_id))]
    pub async fn run(&self, mut cracker_done: watch::Receiver<bool>) -> u64 {
        let mut offset: u64 = 0;
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<CrackedHash> = Vec::new();
        let mut shipped: u64 = 0;
        let mut carry = String::new();

        loop {
            let finished = *cracker_done.borrow();

            offset = self.drain_new_lines(offset, &mut carry, &mut seen, &mut pending).await;

            while pending.len() >= BATCH_FLUSH_SIZE {
                let batch: Vec<CrackedHash> = pending.drain(..BATCH_FLUSH_SIZE).collect();
                shipped += batch.len() as u64;
                self.ship(batch, false).await;
            }
            if !pending.is_empty() {
                let batch = std::mem::take(&mut pending);
                shipped += batch.len() as u64;
                self.ship(batch, false).await;
            }

            if finished {
                // One more pass picked up the tail; now close the stream.
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(BATCH_FLUSH_INTERVAL) => {}
                _ = cracker_done.changed() => {}
            }
        }

        let complete = CrackBatchesCompletePayload { task_id: self.task_id, is_retransmit: false };
        if let Ok(envelope) = Envelope::new(MessageType::CrackBatchesComplete, &complete) {
            if let Err(error) = self.uplink.send(envelope).await {
                warn!("[OUTFILE]: batches-complete send failed: {error}");
            }
        }
        info!("[OUTFILE]: task {} streamed {shipped} unique cracks", self.task_id);
        shipped
    }

    async fn drain_new_lines(
        &self,
        offset: u64,
        carry: &mut String,
        seen: &mut HashSet<String>,
        pending: &mut Vec<CrackedHash>,
    ) -> u64 {
        let Ok(mut file) = fs::File::open(&self.path).await else {
            return offset;
        };
        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            return offset;
        }
        let mut chunk = String::new();
        let Ok(read) = file.read_to_string(&mut chunk).await else {
            return offset;
        };
        if read == 0 {
            return offset;
        }

        carry.push_str(&chunk);
        // The final fragment may be a half-written line; keep it for the
        // next pass unless it ends with a newline.
        let mut lines: Vec<&str> = carry.split('\n').collect();
        let remainder = if carry.ends_with('\n') {
            String::new()
        } else {
            lines.pop().unwrap_or("").to_string()
        };

        for line in lines {
            if let Some(crack) = parse_outfile_line(line) {
                let dedup_key = format!("{}:{}", crack.hash, crack.plain);
                if seen.insert(dedup_key) {
                    pending.push(crack);
                }
            }
        }
        *carry = remainder;
        offset + read as u64
    }

    async fn ship(&self, cracks: Vec<CrackedHash>, is_retransmit: bool) {
        let payload = CrackBatchPayload {
            task_id: self.task_id,
            is_retransmit,
            cracked_hashes: cracks,
        };
        match Envelope::new(MessageType::CrackBatch, &payload) {
            Ok(envelope) => {
                if let Err(error) = self.uplink.send(envelope).await {
                    warn!("[OUTFILE]: crack batch send failed, preserved: {error}");
                }
            }
            Err(error) => warn!("[OUTFILE]: crack batch encode failed: {error}"),
        }
    }
}

/// Replays the full outfile in answer to `request_crack_retransmit`.
#[instrument(skip(uplink, data_dir), fields(task = %task_id))]
pub async fn retransmit_outfile(task_id: Uuid, data_dir: &Path, uplink: Arc<Uplink>) {
    let path = outfile_path(data_dir, task_id);
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(error) => {
            warn!("[OUTFILE]: retransmit read failed for {task_id}: {error}");
            String::new()
        }
    };

    let mut batch: Vec<CrackedHash> = Vec::new();
    let mut total = 0u64;
    for line in content.lines() {
        if let Some(crack) = parse_outfile_line(line) {
            batch.push(crack);
            total += 1;
            if batch.len() >= BATCH_FLUSH_SIZE {
                ship_retransmit_batch(task_id, std::mem::take(&mut batch), &uplink).await;
            }
        }
    }
    if !batch.is_empty() {
        ship_retransmit_batch(task_id, batch, &uplink).await;
    }

    let complete = CrackBatchesCompletePayload { task_id, is_retransmit: true };
    if let Ok(envelope) = Envelope::new(MessageType::CrackBatchesComplete, &complete) {
        let _ = uplink.send(envelope).await;
    }
    info!("[OUTFILE]: retransmitted {total} lines for task {task_id}");
}

async fn ship_retransmit_batch(task_id: Uuid, cracks: Vec<CrackedHash>, uplink: &Arc<Uplink>) {
    let payload = CrackBatchPayload { task_id, is_retransmit: true, cracked_hashes: cracks };
    if let Ok(envelope) = Envelope::new(MessageType::CrackBatch, &payload) {
        if let Err(error) = uplink.send(envelope).await {
            warn!("[OUTFILE]: retransmit batch send failed: {error}");
        }
    }
}

/// Handles `outfile_delete_approved` with the three safety gates:
/// never delete the active task's outfile, delete orphans unconditionally,
/// and verify the exact line count before removing anything else.
#[instrument(skip(board, uplink, data_dir), fields(task = %approval.task_id))]
pub async fn handle_delete_approval(
    approval: OutfileDeleteApprovedPayload,
    board: &TaskBoard,
    data_dir: &Path,
    uplink: Arc<Uplink>,
) {
    let path = outfile_path(data_dir, approval.task_id);

    // Safety 1: a reconnect may have reassigned this very task to us; the
    // running cracker is still appending to the file.
    if board.is_working_on(approval.task_id) {
        warn!("[OUTFILE]: delete refused, task {} is active here", approval.task_id);
        return;
    }

    // Safety 2: orphan of a deleted job; nothing to verify against.
    if !approval.task_exists {
        if let Err(error) = fs::remove_file(&path).await {
            debug!("[OUTFILE]: orphan delete miss: {error}");
        } else {
            info!("[OUTFILE]: orphan outfile for {} removed", approval.task_id);
        }
        return;
    }

    // Safety 3: exact line-count verification.
    let actual = match count_outfile_lines(&path).await {
        Ok(count) => count,
        Err(error) => {
            debug!("[OUTFILE]: count failed (already gone?): {error}");
            return;
        }
    };

    if actual != approval.expected_line_count {
        let rejection = OutfileDeleteRejectedPayload {
            task_id: approval.task_id,
            expected_line_count: approval.expected_line_count,
            actual_line_count: actual,
            reason: "line_count_mismatch".to_string(),
        };
        warn!(
            "[OUTFILE]: delete rejected for {}: expected {}, counted {actual}",
            approval.task_id, approval.expected_line_count
        );
        if let Ok(envelope) = Envelope::new(MessageType::OutfileDeleteRejected, &rejection) {
            let _ = uplink.send(envelope).await;
        }
        return;
    }

    match fs::remove_file(&path).await {
        Ok(()) => info!("[OUTFILE]: outfile for {} deleted ({actual} lines)", approval.task_id),
        Err(error) => warn!("[OUTFILE]: delete failed for {}: {error}", approval.task_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_and_ignores_garbage() {
        let crack = parse_outfile_line("8846f7eaee8fb117ad06bdd830b7586c:password\n").unwrap();
        assert_eq!(crack.hash, "8846f7eaee8fb117ad06bdd830b7586c");
        assert_eq!(crack.plain, "password");

        // Plains may contain the separator.
        let tricky = parse_outfile_line("aabb:pa:ss").unwrap();
        assert_eq!(tricky.plain, "pa:ss");

        assert!(parse_outfile_line("").is_none());
        assert!(parse_outfile_line("noseparator").is_none());
        assert!(parse_outfile_line(":plainonly").is_none());
    }

    #[tokio::test]
    async fn counts_nonempty_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.out");
        fs::write(&path, "a:1\nb:2\n\nc:3\n").await.unwrap();
        assert_eq!(count_outfile_lines(&path).await.unwrap(), 3);
    }

    #[test]
    fn pending_scan_finds_task_outfiles() {
        let dir = tempfile::tempdir().unwrap();
        let outfiles = dir.path().join("outfiles");
        std::fs::create_dir_all(&outfiles).unwrap();
        let task = Uuid::new_v4();
        std::fs::write(outfiles.join(format!("{task}.out")), "a:1\n").unwrap();
        std::fs::write(outfiles.join("junk.tmp"), "").unwrap();

        assert_eq!(pending_outfile_tasks(dir.path()), vec![task]);
    }

    #[tokio::test]
    async fn streamer_dedups_and_signals_completion() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        std::fs::create_dir_all(data_dir.join("outfiles")).unwrap();

        let task_id = Uuid::new_v4();
        let path = outfile_path(&data_dir, task_id);
        fs::write(&path, "aa:x\nbb:y\naa:x\n").await.unwrap();

        let buffer = Arc::new(crate::buffer::DiskBuffer::new(dir.path().join("buffer")).unwrap());
        let uplink = Arc::new(Uplink::new(buffer, Duration::from_millis(100)));
        let mut receiver = uplink.attach();

        let (done_tx, done_rx) = watch::channel(true);
        let streamer = OutfileStreamer::new(task_id, &data_dir, uplink.clone());
        let shipped = streamer.run(done_rx).await;
        drop(done_tx);
        assert_eq!(shipped, 2);

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.message_type, MessageType::CrackBatch);
        let batch: CrackBatchPayload = first.payload_as().unwrap();
        assert_eq!(batch.cracked_hashes.len(), 2);
        assert!(!batch.is_retransmit);

        let second = receiver.recv().await.unwrap();
        assert_eq!(second.message_type, MessageType::CrackBatchesComplete);
    }
}
