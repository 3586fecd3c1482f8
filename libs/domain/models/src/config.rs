// [libs/domain/models/src/config.rs]
//! Timing configuration served at `GET /api/agent/config`. The agent
//! refetches this on every connect so admin changes apply at the next
//! reconnect without redeploying agents.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentTimingConfig {
    /// Server ping cadence the agent should expect.
    pub ping_period_seconds: u64,
    /// Deadline for the agent's pong before the server drops the session.
    pub pong_wait_seconds: u64,
    /// Cracker `--status-timer` value for progress reporting.
    pub report_interval_seconds: u64,
}

impl Default for AgentTimingConfig {
    fn default() -> Self {
        Self {
            ping_period_seconds: 54,
            pong_wait_seconds: 60,
            report_interval_seconds: 5,
        }
    }
}
