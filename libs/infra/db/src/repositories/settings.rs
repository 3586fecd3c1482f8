// [libs/infra/db/src/repositories/settings.rs]
//! Admin-tunable settings with their documented defaults. Services read
//! live values every cycle so an admin change applies without a restart.

use libsql::params;

use crate::client::DbClient;
use crate::errors::DbError;

pub const BENCHMARK_CACHE_DURATION_HOURS: (&str, &str) = ("benchmark_cache_duration_hours", "168");
pub const CHUNK_FLUCTUATION_PERCENTAGE: (&str, &str) = ("chunk_fluctuation_percentage", "20");
pub const DEFAULT_CHUNK_DURATION: (&str, &str) = ("default_chunk_duration", "1200");
pub const SPEEDTEST_TIMEOUT_SECONDS: (&str, &str) = ("speedtest_timeout_seconds", "180");
pub const RULE_SPLIT_ENABLED: (&str, &str) = ("rule_split_enabled", "true");
pub const RULE_SPLIT_THRESHOLD: (&str, &str) = ("rule_split_threshold", "0.5");
pub const RULE_SPLIT_MIN_RULES: (&str, &str) = ("rule_split_min_rules", "10");
pub const MAX_CHUNK_RETRY_ATTEMPTS: (&str, &str) = ("max_chunk_retry_attempts", "3");
pub const POTFILE_ENABLED: (&str, &str) = ("potfile_enabled", "true");
pub const AGENT_PING_PERIOD_SECONDS: (&str, &str) = ("agent_ping_period_seconds", "54");
pub const AGENT_PONG_WAIT_SECONDS: (&str, &str) = ("agent_pong_wait_seconds", "60");
pub const REPORT_INTERVAL_SECONDS: (&str, &str) = ("report_interval_seconds", "5");

const DEFAULTS: &[(&str, &str)] = &[
    BENCHMARK_CACHE_DURATION_HOURS,
    CHUNK_FLUCTUATION_PERCENTAGE,
    DEFAULT_CHUNK_DURATION,
    SPEEDTEST_TIMEOUT_SECONDS,
    RULE_SPLIT_ENABLED,
    RULE_SPLIT_THRESHOLD,
    RULE_SPLIT_MIN_RULES,
    MAX_CHUNK_RETRY_ATTEMPTS,
    POTFILE_ENABLED,
    AGENT_PING_PERIOD_SECONDS,
    AGENT_PONG_WAIT_SECONDS,
    REPORT_INTERVAL_SECONDS,
];

pub struct SettingsRepository {
    database_client: DbClient,
}

impl SettingsRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    /// Seeds every missing key with its default.
    pub async fn seed_defaults(&self) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        for (key, value) in DEFAULTS {
            connection
                .execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT (key) DO NOTHING",
                    params![*key, *value],
                )
                .await?;
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, setting: (&str, &str)) -> Result<String, DbError> {
        let (key, default) = setting;
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<String>(0)?),
            None => Ok(default.to_string()),
        }
    }

    pub async fn get_u64(&self, setting: (&str, &str)) -> Result<u64, DbError> {
        let raw = self.get(setting).await?;
        raw.parse::<u64>()
            .map_err(|_| DbError::Mapping(format!("setting {} is not an integer: {raw}", setting.0)))
    }

    pub async fn get_f64(&self, setting: (&str, &str)) -> Result<f64, DbError> {
        let raw = self.get(setting).await?;
        raw.parse::<f64>()
            .map_err(|_| DbError::Mapping(format!("setting {} is not a number: {raw}", setting.0)))
    }

    pub async fn get_bool(&self, setting: (&str, &str)) -> Result<bool, DbError> {
        let raw = self.get(setting).await?;
        match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(DbError::Mapping(format!(
                "setting {} is not a boolean: {other}",
                setting.0
            ))),
        }
    }
}
