// [apps/agent/src/config.rs]
//! Agent directives from CLI flags and environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use krakenhashes_telemetry::env_duration;

/// Command-line and environment configuration for one agent process.
#[derive(Parser, Debug, Clone)]
#[command(name = "krakenhashes-agent", about = "KrakenHashes remote cracking agent")]
pub struct AgentDirectives {
    /// Server base URL, e.g. https://kraken.example.org:31337
    #[arg(long, env = "KH_SERVER_URL")]
    pub server_url: String,

    /// API key issued at registration.
    #[arg(long, env = "KH_API_KEY")]
    pub api_key: String,

    /// Numeric agent id issued at registration.
    #[arg(long, env = "KH_AGENT_ID")]
    pub agent_id: i64,

    /// Root of the agent's data directory tree.
    #[arg(long, env = "KH_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Use the mock hardware monitor instead of probing devices.
    #[arg(long, env = "TEST_MODE", default_value_t = false)]
    pub test_mode: bool,

    /// Extra verbosity and debug message handling.
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub directives: AgentDirectives,
    /// Send deadline for must-deliver messages.
    pub write_wait: Duration,
    /// How long to wait for server traffic before declaring the link dead.
    /// Refreshed from the server's timing config on every connect.
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl AgentConfig {
    pub fn from_directives(directives: AgentDirectives) -> Self {
        Self {
            directives,
            write_wait: env_duration("KH_WRITE_WAIT", Duration::from_secs(5)),
            pong_wait: env_duration("KH_PONG_WAIT", Duration::from_secs(60)),
            ping_period: env_duration("KH_PING_PERIOD", Duration::from_secs(54)),
        }
    }

    /// Applies server-supplied timing, keeping any explicit env overrides.
    pub fn apply_server_timing(&mut self, config: &krakenhashes_models::AgentTimingConfig) {
        if std::env::var("KH_PING_PERIOD").is_err() {
            self.ping_period = Duration::from_secs(config.ping_period_seconds);
        }
        if std::env::var("KH_PONG_WAIT").is_err() {
            self.pong_wait = Duration::from_secs(config.pong_wait_seconds);
        }
    }

    /// `wss://host/api/v1/ws/agent` derived from the HTTP base URL.
    pub fn websocket_url(&self) -> String {
        let base = self.directives.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{base}")
        };
        format!("{ws_base}/api/v1/ws/agent")
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.directives.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directives(url: &str) -> AgentDirectives {
        AgentDirectives {
            server_url: url.to_string(),
            api_key: "key".into(),
            agent_id: 1,
            data_dir: PathBuf::from("data"),
            test_mode: true,
            debug: false,
        }
    }

    #[test]
    fn websocket_url_follows_scheme() {
        let secure = AgentConfig::from_directives(directives("https://kh.example:31337/"));
        assert_eq!(secure.websocket_url(), "wss://kh.example:31337/api/v1/ws/agent");

        let plain = AgentConfig::from_directives(directives("http://localhost:8080"));
        assert_eq!(plain.websocket_url(), "ws://localhost:8080/api/v1/ws/agent");
    }
}
