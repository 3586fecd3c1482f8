// [libs/domain/models/src/file.rs]
//! Synced file descriptors and the agent's on-disk layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Wordlist,
    Rule,
    Binary,
    Hashlist,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Wordlist => "wordlist",
            FileType::Rule => "rule",
            FileType::Binary => "binary",
            FileType::Hashlist => "hashlist",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "wordlist" => Some(FileType::Wordlist),
            "rule" => Some(FileType::Rule),
            "binary" => Some(FileType::Binary),
            "hashlist" => Some(FileType::Hashlist),
            _ => None,
        }
    }

    /// Directory name under the agent data dir, plural for collections.
    pub fn dir_name(&self) -> &'static str {
        match self {
            FileType::Wordlist => "wordlists",
            FileType::Rule => "rules",
            FileType::Binary => "binaries",
            FileType::Hashlist => "hashlists",
        }
    }
}

/// A file the server instructs an agent to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: i64,
    pub name: String,
    /// Optional sub-category directory, e.g. a wordlist collection name.
    pub category: Option<String>,
    pub file_type: FileType,
    pub md5: String,
    pub size: u64,
}

/// One row of an agent's reported inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFileEntry {
    pub file_type: FileType,
    pub category: Option<String>,
    pub name: String,
    pub md5: String,
    pub size: u64,
}

/// Resolves where a synced file lives under the agent data dir:
/// `{data}/{file_type}/{category?}/{name}`.
pub fn local_path(data_dir: &Path, file_type: FileType, category: Option<&str>, name: &str) -> PathBuf {
    let mut path = data_dir.join(file_type.dir_name());
    if let Some(category) = category {
        path = path.join(category);
    }
    path.join(name)
}

/// `{data}/hashlists/{hashlist_id}.hash`
pub fn hashlist_path(data_dir: &Path, hashlist_id: Uuid) -> PathBuf {
    data_dir.join("hashlists").join(format!("{hashlist_id}.hash"))
}

/// `{data}/hashlists/original/{hashlist_id}_{name}`: verbatim upload kept
/// for association-mode jobs.
pub fn original_hashlist_path(data_dir: &Path, hashlist_id: Uuid, name: &str) -> PathBuf {
    data_dir
        .join("hashlists")
        .join("original")
        .join(format!("{hashlist_id}_{name}"))
}

/// `{data}/outfiles/{task_id}.out`
pub fn outfile_path(data_dir: &Path, task_id: Uuid) -> PathBuf {
    data_dir.join("outfiles").join(format!("{task_id}.out"))
}

/// `{data}/rules/chunks/{job_dir}/{chunk_name}`
pub fn rule_chunk_path(data_dir: &Path, job_dir: &str, chunk_name: &str) -> PathBuf {
    data_dir.join("rules").join("chunks").join(job_dir).join(chunk_name)
}

/// `{data}/buffer/{agent_id}`: disk-backed disconnect buffer.
pub fn buffer_dir(data_dir: &Path, agent_id: i64) -> PathBuf {
    data_dir.join("buffer").join(agent_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        let data = Path::new("/data");
        assert_eq!(
            local_path(data, FileType::Wordlist, Some("common"), "rockyou.txt"),
            Path::new("/data/wordlists/common/rockyou.txt")
        );
        assert_eq!(
            local_path(data, FileType::Rule, None, "best64.rule"),
            Path::new("/data/rules/best64.rule")
        );

        let id = Uuid::nil();
        assert_eq!(
            hashlist_path(data, id),
            Path::new("/data/hashlists/00000000-0000-0000-0000-000000000000.hash")
        );
        assert_eq!(
            outfile_path(data, id),
            Path::new("/data/outfiles/00000000-0000-0000-0000-000000000000.out")
        );
        assert_eq!(
            original_hashlist_path(data, id, "dump.txt"),
            Path::new("/data/hashlists/original/00000000-0000-0000-0000-000000000000_dump.txt")
        );
    }
}
