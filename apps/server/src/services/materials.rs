// [apps/server/src/services/materials.rs]
//! Resolves a job's attack material into the agent-relative paths carried
//! by assignments and benchmark requests.

use anyhow::Context;

use krakenhashes_db::repositories::FileRepository;
use krakenhashes_models::{BinaryPattern, FileType, JobExecution};

use crate::state::AppState;

/// Hash types whose speed depends on the salt count; their benchmark cache
/// key carries the salt dimension.
const SALTED_HASH_TYPES: &[u32] = &[
    10, 20, 110, 120, 400, 500, 1100, 1410, 1420, 1800, 2100, 3200, 5500, 5600, 7500,
];

pub fn is_salted_hash_type(hash_type: u32) -> bool {
    SALTED_HASH_TYPES.contains(&hash_type)
}

/// Salt dimension for a job's benchmark key; the hashlist's uncracked count
/// stands in for the distinct salt count.
pub fn salt_count_for(job: &JobExecution, uncracked: u64) -> Option<u64> {
    is_salted_hash_type(job.hash_type).then_some(uncracked)
}

/// Agent-relative paths for one job's material.
#[derive(Debug, Clone)]
pub struct JobMaterials {
    pub hashlist_path: String,
    pub wordlist_paths: Vec<String>,
    pub rule_paths: Vec<String>,
    pub binary_path: String,
    pub binary_id: i64,
}

/// Builds the material set, resolving the newest binary satisfying the
/// job's pattern.
pub async fn resolve_job_materials(
    state: &AppState,
    job: &JobExecution,
) -> anyhow::Result<JobMaterials> {
    let files = FileRepository::new(state.db.clone());

    let mut wordlist_paths = Vec::new();
    for wordlist_id in &job.wordlist_ids {
        let file = files
            .get(FileType::Wordlist, *wordlist_id)
            .await
            .with_context(|| format!("wordlist {wordlist_id} not registered"))?;
        wordlist_paths.push(relative_path(&file.info));
    }
    if let Some(assoc_id) = job.assoc_wordlist_id {
        let file = files
            .get(FileType::Wordlist, assoc_id)
            .await
            .with_context(|| format!("association wordlist {assoc_id} not registered"))?;
        wordlist_paths.push(relative_path(&file.info));
    }

    let mut rule_paths = Vec::new();
    for rule_id in &job.rule_ids {
        let file = files
            .get(FileType::Rule, *rule_id)
            .await
            .with_context(|| format!("rule {rule_id} not registered"))?;
        rule_paths.push(relative_path(&file.info));
    }

    let releases = files.binary_releases().await?;
    let pattern = BinaryPattern::parse(&job.binary_pattern)
        .with_context(|| format!("job {} has a malformed binary pattern", job.id))?;
    let release = pattern.resolve(&releases)?;

    Ok(JobMaterials {
        hashlist_path: format!("hashlists/{}.hash", job.hashlist_id),
        wordlist_paths,
        rule_paths,
        binary_path: format!("binaries/{}/hashcat", release.id),
        binary_id: release.id,
    })
}

fn relative_path(info: &krakenhashes_models::FileInfo) -> String {
    match &info.category {
        Some(category) => format!("{}/{}/{}", info.file_type.dir_name(), category, info.name),
        None => format!("{}/{}", info.file_type.dir_name(), info.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_classification() {
        assert!(is_salted_hash_type(3200));
        assert!(is_salted_hash_type(1800));
        assert!(!is_salted_hash_type(0));
        assert!(!is_salted_hash_type(1000));
    }
}
