// [libs/core/keyspace/src/rules.rs]
//! Rule splitting: dividing a rule file so each task runs the full wordlist
//! with a subset of rules.

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::KeyspaceError;

/// Decides whether a job should be split by rules rather than keyspace.
///
/// Split when the estimated runtime exceeds `threshold × chunk_duration` and
/// the job carries at least `min_rules` rules. Deferred until the first
/// benchmark supplies an accurate speed.
pub fn should_split_rules(
    effective_keyspace: u64,
    speed: u64,
    chunk_duration_secs: u64,
    threshold: f64,
    min_rules: u64,
    rule_count: u64,
) -> bool {
    if speed == 0 || rule_count < min_rules {
        return false;
    }
    let estimated_duration = effective_keyspace as f64 / speed as f64;
    estimated_duration > threshold * chunk_duration_secs as f64
}

/// Number of rule chunks: `max(2, ceil(duration / chunk_duration))`, capped
/// at the rule count so no chunk is empty.
pub fn split_count(
    effective_keyspace: u64,
    speed: u64,
    chunk_duration_secs: u64,
    rule_count: u64,
) -> u32 {
    if speed == 0 || chunk_duration_secs == 0 || rule_count == 0 {
        return rule_count.min(2).max(1) as u32;
    }
    let estimated_duration = effective_keyspace as f64 / speed as f64;
    let wanted = (estimated_duration / chunk_duration_secs as f64).ceil() as u64;
    wanted.max(2).min(rule_count) as u32
}

/// Bounds of chunk `chunk_index` when `rule_count` rules are divided into
/// `split_count` near-even ranges. Returns `None` once every rule is covered.
pub fn rule_chunk_bounds(rule_count: u32, split_count: u32, chunk_index: u32) -> Option<(u32, u32)> {
    if split_count == 0 || chunk_index >= split_count || rule_count == 0 {
        return None;
    }
    // First `remainder` chunks take one extra rule so the split stays even.
    let base = rule_count / split_count;
    let remainder = rule_count % split_count;
    let extra_before = chunk_index.min(remainder);
    let start = chunk_index * base + extra_before;
    let width = if chunk_index < remainder { base + 1 } else { base };
    if width == 0 {
        return None;
    }
    Some((start, start + width))
}

/// Materializes rules `[start, end)` of `source` into `destination`,
/// creating parent directories. Line indices count every line of the source
/// file, matching how the cracker numbers rules for `crack_pos`.
///
/// # Errors
/// `KeyspaceError::RuleRangeOutOfBounds` when the range exceeds the file;
/// `KeyspaceError::RuleChunkIo` for filesystem failures.
pub async fn write_rule_chunk(
    source: &Path,
    destination: &Path,
    start: u32,
    end: u32,
) -> Result<u32, KeyspaceError> {
    let raw = fs::read_to_string(source)
        .await
        .map_err(|error| KeyspaceError::RuleChunkIo(error.to_string()))?;
    let lines: Vec<&str> = raw.lines().collect();
    let total = lines.len() as u32;
    if start >= end || end > total {
        return Err(KeyspaceError::RuleRangeOutOfBounds { start, end, total });
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|error| KeyspaceError::RuleChunkIo(error.to_string()))?;
    }

    let mut chunk = String::new();
    for line in &lines[start as usize..end as usize] {
        chunk.push_str(line);
        chunk.push('\n');
    }

    // tmp + rename so a crashed write never leaves a truncated chunk behind.
    let tmp = destination.with_extension("tmp");
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|error| KeyspaceError::RuleChunkIo(error.to_string()))?;
    file.write_all(chunk.as_bytes())
        .await
        .map_err(|error| KeyspaceError::RuleChunkIo(error.to_string()))?;
    file.sync_all()
        .await
        .map_err(|error| KeyspaceError::RuleChunkIo(error.to_string()))?;
    fs::rename(&tmp, destination)
        .await
        .map_err(|error| KeyspaceError::RuleChunkIo(error.to_string()))?;

    Ok(end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_decision_needs_speed_rules_and_duration() {
        // 10^12 keyspace at 10^6/s = 10^6 s >> 0.5 × 1200 s.
        assert!(should_split_rules(1_000_000_000_000, 1_000_000, 1200, 0.5, 10, 64));
        // Too few rules.
        assert!(!should_split_rules(1_000_000_000_000, 1_000_000, 1200, 0.5, 10, 4));
        // Fast enough to finish inside the threshold.
        assert!(!should_split_rules(100_000, 1_000_000, 1200, 0.5, 10, 64));
        // No measured speed yet: decision stays deferred.
        assert!(!should_split_rules(1_000_000_000_000, 0, 1200, 0.5, 10, 64));
    }

    #[test]
    fn split_count_is_at_least_two_and_capped() {
        // 10^9 / 10^6 = 1000 s, /1200 → ceil 1 → floor of 2.
        assert_eq!(split_count(1_000_000_000, 1_000_000, 1200, 64), 2);
        // 10^12 / 10^6 = 10^6 s, /1200 → 834 chunks, capped at 64 rules.
        assert_eq!(split_count(1_000_000_000_000, 1_000_000, 1200, 64), 64);
        // Uncapped case.
        assert_eq!(split_count(6_000_000_000, 1_000_000, 1200, 64), 5);
    }

    #[test]
    fn rule_bounds_partition_every_rule_exactly_once() {
        let rule_count = 77;
        let splits = 5;
        let mut covered = Vec::new();
        for index in 0..splits {
            let (start, end) = rule_chunk_bounds(rule_count, splits, index).unwrap();
            covered.extend(start..end);
        }
        assert_eq!(covered, (0..rule_count).collect::<Vec<_>>());
        assert_eq!(rule_chunk_bounds(rule_count, splits, splits), None);
    }

    #[test]
    fn rule_bounds_handle_degenerate_inputs() {
        assert_eq!(rule_chunk_bounds(0, 4, 0), None);
        assert_eq!(rule_chunk_bounds(10, 0, 0), None);
        // More splits than rules: trailing chunks are empty and skipped.
        assert_eq!(rule_chunk_bounds(2, 4, 0), Some((0, 1)));
        assert_eq!(rule_chunk_bounds(2, 4, 1), Some((1, 2)));
        assert_eq!(rule_chunk_bounds(2, 4, 2), None);
    }

    #[tokio::test]
    async fn writes_requested_rule_range() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("best64.rule");
        tokio::fs::write(&source, ":\nl\nu\nc\nr\n").await.unwrap();

        let destination = dir.path().join("chunks/job-1/chunk_1.rule");
        let written = write_rule_chunk(&source, &destination, 1, 4).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(
            tokio::fs::read_to_string(&destination).await.unwrap(),
            "l\nu\nc\n"
        );

        let out_of_bounds = write_rule_chunk(&source, &destination, 3, 9).await;
        assert_eq!(
            out_of_bounds.unwrap_err(),
            KeyspaceError::RuleRangeOutOfBounds { start: 3, end: 9, total: 5 }
        );
    }
}
