// [libs/core/keyspace/src/chunk.rs]
//! Candidate chunk sizing from measured agent speed.

/// Floor for any dispatched chunk; protects against near-zero benchmark
/// speeds producing thousands of trivial tasks.
pub const MIN_CHUNK_KEYSPACE: u64 = 1_000;

/// A planned slice of remaining work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub size: u64,
    /// True when the near-final leftover was folded into this chunk.
    pub absorbed_remainder: bool,
    /// True when this chunk drains the remaining keyspace.
    pub is_final: bool,
}

/// Sizes the next chunk: `speed × target_duration`, clamped by the remaining
/// work and the minimum, absorbing a leftover smaller than
/// `fluctuation_percent` of the target into this chunk so no agent is left a
/// sliver.
///
/// Returns `None` when there is no work left.
pub fn plan_chunk(
    remaining: u64,
    speed: u64,
    target_duration_secs: u64,
    fluctuation_percent: u64,
) -> Option<ChunkPlan> {
    if remaining == 0 {
        return None;
    }

    let target = speed
        .saturating_mul(target_duration_secs)
        .max(MIN_CHUNK_KEYSPACE);

    if target >= remaining {
        return Some(ChunkPlan {
            size: remaining,
            absorbed_remainder: false,
            is_final: true,
        });
    }

    let leftover = remaining - target;
    let absorb_threshold = target.saturating_mul(fluctuation_percent) / 100;
    if leftover <= absorb_threshold {
        return Some(ChunkPlan {
            size: remaining,
            absorbed_remainder: true,
            is_final: true,
        });
    }

    Some(ChunkPlan {
        size: target,
        absorbed_remainder: false,
        is_final: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_work_means_no_chunk() {
        assert_eq!(plan_chunk(0, 1_000_000, 1200, 20), None);
    }

    #[test]
    fn chunk_is_speed_times_duration() {
        let plan = plan_chunk(10_000_000_000, 1_000_000, 1200, 20).unwrap();
        assert_eq!(plan.size, 1_200_000_000);
        assert!(!plan.is_final);
    }

    #[test]
    fn clamps_to_remaining() {
        let plan = plan_chunk(500, 1_000_000, 1200, 20).unwrap();
        assert_eq!(plan.size, 500);
        assert!(plan.is_final);
        assert!(!plan.absorbed_remainder);
    }

    #[test]
    fn absorbs_near_final_leftover() {
        // Target 1_200_000, leftover 200_000 = 16.7% of target: inside the
        // 20% fluctuation window, so the chunk takes everything.
        let plan = plan_chunk(1_400_000, 1_000, 1200, 20).unwrap();
        assert_eq!(plan.size, 1_400_000);
        assert!(plan.absorbed_remainder);
        assert!(plan.is_final);

        // Leftover 300_000 = 25% of target: outside the window.
        let plan = plan_chunk(1_500_000, 1_000, 1200, 20).unwrap();
        assert_eq!(plan.size, 1_200_000);
        assert!(!plan.absorbed_remainder);
        assert!(!plan.is_final);
    }

    #[test]
    fn enforces_minimum_chunk() {
        // A glacial speed still produces at least the floor.
        let plan = plan_chunk(1_000_000, 0, 1200, 20).unwrap();
        assert_eq!(plan.size, MIN_CHUNK_KEYSPACE);
    }

    #[test]
    fn zero_fluctuation_never_absorbs() {
        let plan = plan_chunk(1_200_001, 1_000, 1200, 0).unwrap();
        assert_eq!(plan.size, 1_200_000);
        assert!(!plan.absorbed_remainder);
    }
}
