// [libs/domain/models/src/benchmark.rs]
//! Per-agent speed measurements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel standing in for a NULL salt count so the (agent, attack, hash,
/// salt) uniqueness comparison stays total for unsalted hash types.
pub const NO_SALT_SENTINEL: i64 = -1;

/// One recorded speed for (agent, attack mode, hash type, salt count).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBenchmark {
    pub agent_id: i64,
    pub attack_mode: u8,
    pub hash_type: u32,
    /// Present only for salted hash types; two missing dimensions trigger a
    /// fresh benchmark.
    pub salt_count: Option<u64>,
    /// Candidates per second, summed across enabled devices.
    pub speed: u64,
    pub measured_at: DateTime<Utc>,
}

impl AgentBenchmark {
    /// NULL-safe salt key used in storage and lookups.
    pub fn salt_key(salt_count: Option<u64>) -> i64 {
        salt_count.map(|count| count as i64).unwrap_or(NO_SALT_SENTINEL)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, cache_duration_hours: i64) -> bool {
        now - self.measured_at > chrono::Duration::hours(cache_duration_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_key_is_null_safe() {
        assert_eq!(AgentBenchmark::salt_key(None), NO_SALT_SENTINEL);
        assert_eq!(AgentBenchmark::salt_key(Some(0)), 0);
        assert_eq!(AgentBenchmark::salt_key(Some(12)), 12);
    }

    #[test]
    fn staleness_uses_cache_duration() {
        let now = Utc::now();
        let bench = AgentBenchmark {
            agent_id: 1,
            attack_mode: 0,
            hash_type: 1000,
            salt_count: None,
            speed: 1_000_000,
            measured_at: now - chrono::Duration::hours(200),
        };
        assert!(bench.is_stale(now, 168));
        assert!(!bench.is_stale(now, 720));
    }
}
