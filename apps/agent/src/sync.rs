// [apps/agent/src/sync.rs]
//! File sync: inventory scanning, the bounded download manager, and binary
//! archive extraction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use krakenhashes_models::file::local_path;
use krakenhashes_models::messages::FileSyncStatusPayload;
use krakenhashes_models::{AgentFileEntry, FileInfo, FileType};
use krakenhashes_server_client::ServerClient;

/// Concurrent downloads; more just thrashes the link.
pub const DOWNLOAD_CONCURRENCY: usize = 3;

/// Directories under a file-type root that are server-managed scratch space
/// and never part of the reported inventory.
const SKIPPED_SUBDIRS: &[&str] = &["chunks", "original"];

pub struct FileSyncManager {
    data_dir: PathBuf,
    server: Arc<ServerClient>,
    download_slots: Arc<Semaphore>,
    /// Names currently downloading; duplicate requests are rejected.
    in_flight: Mutex<HashSet<String>>,
}

impl FileSyncManager {
    pub fn new(data_dir: PathBuf, server: Arc<ServerClient>) -> Self {
        Self {
            data_dir,
            server,
            download_slots: Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Walks the data tree and reports every held file with its digest.
    #[instrument(skip(self))]
    pub async fn scan_inventory(&self) -> Vec<AgentFileEntry> {
        let data_dir = self.data_dir.clone();
        // Hashing a big wordlist tree is minutes of CPU; keep it off the
        // runtime threads.
        tokio::task::spawn_blocking(move || scan_inventory_blocking(&data_dir))
            .await
            .unwrap_or_default()
    }

    /// Executes a `file_sync_command`: downloads every listed file through
    /// the bounded slots, extracting binary archives in place.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub async fn execute_sync(&self, files: Vec<FileInfo>) -> FileSyncStatusPayload {
        let mut accepted = Vec::new();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for file in files {
                let key = format!("{}/{}", file.file_type.as_str(), file.name);
                if in_flight.insert(key.clone()) {
                    accepted.push((key, file));
                } else {
                    debug!("[SYNC]: duplicate download rejected: {key}");
                }
            }
        }

        let mut handles = Vec::new();
        for (key, file) in accepted {
            let slots = Arc::clone(&self.download_slots);
            let server = Arc::clone(&self.server);
            let data_dir = self.data_dir.clone();
            handles.push((key.clone(), tokio::spawn(async move {
                let _permit = slots.acquire_owned().await.expect("semaphore never closed");
                download_one(&server, &data_dir, &file).await
            })));
        }

        let mut downloaded = 0u32;
        let mut failed = 0u32;
        for (key, handle) in handles {
            let result = handle.await;
            {
                let mut in_flight =
                    self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                in_flight.remove(&key);
            }
            match result {
                Ok(Ok(())) => downloaded += 1,
                Ok(Err(error)) => {
                    warn!("[SYNC]: download failed for {key}: {error}");
                    failed += 1;
                }
                Err(join_error) => {
                    warn!("[SYNC]: download task panicked for {key}: {join_error}");
                    failed += 1;
                }
            }
        }

        info!("[SYNC]: command finished: {downloaded} downloaded, {failed} failed");
        FileSyncStatusPayload {
            completed: failed == 0,
            downloaded,
            failed,
            message: (failed > 0).then(|| format!("{failed} downloads failed")),
        }
    }

    /// Repairs binary directories holding an archive without an extracted
    /// executable, e.g. after a crash between download and extraction.
    #[instrument(skip(self))]
    pub async fn pre_sync_sweep(&self) {
        let binaries_root = self.data_dir.join("binaries");
        let Ok(entries) = std::fs::read_dir(&binaries_root) else { return };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(archive) = find_archive(&dir) else { continue };
            if has_executable_sibling(&dir) {
                continue;
            }
            info!("[SYNC]: sweep extracting {:?}", archive.file_name());
            if let Err(error) = extract_archive(&archive, &dir).await {
                warn!("[SYNC]: sweep extraction failed: {error}");
            }
        }
    }
}

async fn download_one(
    server: &ServerClient,
    data_dir: &Path,
    file: &FileInfo,
) -> Result<(), krakenhashes_server_client::ClientError> {
    let destination = local_path(data_dir, file.file_type, file.category.as_deref(), &file.name);
    server.download_file(file, &destination).await?;

    if file.file_type == FileType::Binary && is_archive(&destination) {
        let target_dir = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join("binaries"));
        extract_archive(&destination, &target_dir)
            .await
            .map_err(krakenhashes_server_client::ClientError::Io)?;
    }
    Ok(())
}

/// Unpacks a `.tar.gz` / `.tgz` archive into `target_dir`.
pub async fn extract_archive(archive: &Path, target_dir: &Path) -> std::io::Result<()> {
    let archive = archive.to_path_buf();
    let target = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut unpacker = tar::Archive::new(decoder);
        unpacker.unpack(&target)
    })
    .await
    .map_err(|join_error| std::io::Error::other(join_error.to_string()))?
}

fn is_archive(path: &Path) -> bool {
    let name = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn find_archive(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| is_archive(path))
}

/// Whether the directory already holds a non-archive regular file, i.e. the
/// extraction produced something.
fn has_executable_sibling(dir: &Path) -> bool {
    fn walk(dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else { return false };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if walk(&path) {
                    return true;
                }
            } else if !is_archive(&path) {
                return true;
            }
        }
        false
    }
    walk(dir)
}

fn scan_inventory_blocking(data_dir: &Path) -> Vec<AgentFileEntry> {
    let mut inventory = Vec::new();
    for file_type in [FileType::Wordlist, FileType::Rule, FileType::Binary, FileType::Hashlist] {
        let root = data_dir.join(file_type.dir_name());
        scan_dir(&root, &root, file_type, &mut inventory);
    }
    inventory.sort_by(|a, b| (a.file_type.as_str(), &a.name).cmp(&(b.file_type.as_str(), &b.name)));
    inventory
}

fn scan_dir(root: &Path, dir: &Path, file_type: FileType, inventory: &mut Vec<AgentFileEntry>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let dir_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if SKIPPED_SUBDIRS.contains(&dir_name) {
                continue;
            }
            scan_dir(root, &path, file_type, inventory);
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) == Some("part") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else { continue };
        let category = path
            .parent()
            .filter(|parent| *parent != root)
            .and_then(|parent| parent.strip_prefix(root).ok())
            .and_then(|relative| relative.to_str())
            .filter(|relative| !relative.is_empty())
            .map(|relative| relative.to_string());

        let Ok(bytes) = std::fs::read(&path) else { continue };
        let mut digest = Md5::new();
        digest.update(&bytes);

        inventory.push(AgentFileEntry {
            file_type,
            category,
            name: name.to_string(),
            md5: hex::encode(digest.finalize()),
            size: bytes.len() as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_scan_reports_digests_and_categories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("wordlists/common")).unwrap();
        std::fs::create_dir_all(root.join("rules/chunks/job-1")).unwrap();
        std::fs::write(root.join("wordlists/common/tiny.txt"), b"password\n").unwrap();
        std::fs::write(root.join("rules/best64.rule"), b":\n").unwrap();
        // Chunk scratch space is not inventory.
        std::fs::write(root.join("rules/chunks/job-1/c0.rule"), b"l\n").unwrap();
        // Half-downloaded files are not inventory either.
        std::fs::write(root.join("rules/partial.rule.part"), b"x").unwrap();

        let inventory = scan_inventory_blocking(root);
        assert_eq!(inventory.len(), 2);

        let wordlist = inventory.iter().find(|e| e.file_type == FileType::Wordlist).unwrap();
        assert_eq!(wordlist.name, "tiny.txt");
        assert_eq!(wordlist.category.as_deref(), Some("common"));
        assert_eq!(wordlist.md5, format!("{:x}", Md5::digest(b"password\n")));

        let rule = inventory.iter().find(|e| e.file_type == FileType::Rule).unwrap();
        assert_eq!(rule.category, None);
    }

    #[tokio::test]
    async fn archive_round_trip_and_sweep_detection() {
        let dir = tempfile::tempdir().unwrap();
        let binary_dir = dir.path().join("binaries/4");
        std::fs::create_dir_all(&binary_dir).unwrap();

        // Build a small tar.gz holding a fake executable.
        let archive_path = binary_dir.join("hashcat-6.2.6.tar.gz");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let payload = b"#!/bin/sh\necho ok\n";
            let mut header = tar::Header::new_gnu();
            header.set_path("hashcat").unwrap();
            header.set_size(payload.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, payload.as_slice()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        assert!(find_archive(&binary_dir).is_some());
        assert!(!has_executable_sibling(&binary_dir));

        extract_archive(&archive_path, &binary_dir).await.unwrap();
        assert!(binary_dir.join("hashcat").exists());
        assert!(has_executable_sibling(&binary_dir));
    }
}
