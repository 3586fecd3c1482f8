// [libs/core/keyspace/src/refine.rs]
//! Progressive keyspace refinement from task actuals.
//!
//! Hashcat only reveals the true effective keyspace while running, so the
//! job's estimate is corrected as chunks report `progress[1]`. Corrections
//! pass a sanity floor, and the chunk chain is re-based so effective windows
//! stay monotone.

/// A single-task estimate is replaced only when the actual diverges by more
/// than this many candidate×rule pairs.
pub const SINGLE_TASK_DIVERGENCE: u64 = 1_000;

/// Refinements below this fraction of the current estimate are rejected as
/// reporting glitches.
pub const SANITY_FLOOR_RATIO: f64 = 0.1;

/// Refines a non-splitting single-task job from its reported actual.
pub fn refine_single_task(current_effective: u64, actual: u64) -> Option<u64> {
    if actual == 0 {
        return None;
    }
    if current_effective.abs_diff(actual) > SINGLE_TASK_DIVERGENCE {
        Some(actual)
    } else {
        None
    }
}

/// Refines a rule-splitting job: the sum of reported actuals plus a
/// per-remaining-rule extrapolation from the observed average.
///
/// Returns `None` when nothing was observed yet, when the estimate would be
/// zero, or when it falls under the sanity floor.
pub fn refine_rule_split(
    sum_of_actuals: u64,
    rules_covered: u32,
    rules_remaining: u32,
    current_effective: u64,
) -> Option<u64> {
    if rules_covered == 0 || sum_of_actuals == 0 {
        return None;
    }
    let average_per_rule = sum_of_actuals as f64 / rules_covered as f64;
    let estimate = sum_of_actuals + (average_per_rule * rules_remaining as f64) as u64;

    if estimate == 0 {
        return None;
    }
    if (estimate as f64) < current_effective as f64 * SANITY_FLOOR_RATIO {
        return None;
    }
    Some(estimate)
}

/// One chunk's view for cascade recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeChunk {
    /// Effective width: the reported actual when present, the planned window
    /// otherwise.
    pub width: u64,
    /// Keyspace-split chunks report the whole job's effective keyspace, not
    /// their own, so the cascade never moves them.
    pub is_keyspace_split: bool,
    pub effective_start: u64,
    pub effective_end: u64,
}

/// Re-bases `effective_start/end` of every chunk after `anchor_end` so the
/// chain stays monotone after one chunk's width was corrected.
///
/// Returns how many chunks moved.
pub fn cascade_recompute(anchor_end: u64, chunks: &mut [CascadeChunk]) -> usize {
    let mut cursor = anchor_end;
    let mut moved = 0;
    for chunk in chunks {
        if chunk.is_keyspace_split {
            continue;
        }
        let new_end = cursor + chunk.width;
        if chunk.effective_start != cursor || chunk.effective_end != new_end {
            chunk.effective_start = cursor;
            chunk.effective_end = new_end;
            moved += 1;
        }
        cursor = new_end;
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_task_refines_only_past_divergence() {
        assert_eq!(refine_single_task(1_000_000, 1_000_500), None);
        assert_eq!(refine_single_task(1_000_000, 1_002_000), Some(1_002_000));
        assert_eq!(refine_single_task(1_000_000, 900_000), Some(900_000));
        assert_eq!(refine_single_task(1_000_000, 0), None);
    }

    #[test]
    fn rule_split_extrapolates_from_average() {
        // 3 chunks of 10 rules each reported 3_000_000 total; 34 rules left.
        let refined = refine_rule_split(3_000_000, 30, 34, 6_000_000).unwrap();
        assert_eq!(refined, 3_000_000 + 100_000 * 34);
    }

    #[test]
    fn rule_split_rejects_zero_and_sanity_floor() {
        assert_eq!(refine_rule_split(0, 10, 54, 6_000_000), None);
        assert_eq!(refine_rule_split(100, 0, 64, 6_000_000), None);
        // 200 observed + tiny extrapolation against a 6M current estimate:
        // under the 10% floor, rejected.
        assert_eq!(refine_rule_split(200, 32, 32, 6_000_000), None);
    }

    #[test]
    fn cascade_rebases_chain_and_skips_keyspace_splits() {
        let mut chunks = vec![
            CascadeChunk { width: 100, is_keyspace_split: false, effective_start: 90, effective_end: 190 },
            CascadeChunk { width: 50, is_keyspace_split: true, effective_start: 190, effective_end: 240 },
            CascadeChunk { width: 70, is_keyspace_split: false, effective_start: 240, effective_end: 310 },
        ];

        let moved = cascade_recompute(120, &mut chunks);
        assert_eq!(moved, 2);
        assert_eq!(chunks[0].effective_start, 120);
        assert_eq!(chunks[0].effective_end, 220);
        // The keyspace-split chunk is untouched.
        assert_eq!(chunks[1].effective_start, 190);
        assert_eq!(chunks[1].effective_end, 240);
        // The chain continues from the last non-split cursor.
        assert_eq!(chunks[2].effective_start, 220);
        assert_eq!(chunks[2].effective_end, 290);
    }

    #[test]
    fn cascade_is_idempotent_once_settled() {
        let mut chunks = vec![
            CascadeChunk { width: 10, is_keyspace_split: false, effective_start: 0, effective_end: 0 },
            CascadeChunk { width: 20, is_keyspace_split: false, effective_start: 0, effective_end: 0 },
        ];
        assert_eq!(cascade_recompute(5, &mut chunks), 2);
        assert_eq!(cascade_recompute(5, &mut chunks), 0);
    }
}
