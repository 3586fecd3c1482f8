// [libs/shared/telemetry/src/lib.rs]
//! Observability bootstrap shared by the server and agent binaries.
//!
//! Development builds emit compact human-readable traces; release builds emit
//! flattened JSON for log ingestion. A global panic hook forwards any thread
//! collapse into the trace stream before the process dies.

use std::panic;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber and panic hook.
///
/// `LOG_LEVEL` overrides the default level; the usual `RUST_LOG` directive
/// syntax wins over both when present. Panics if another global subscriber
/// was already installed.
pub fn init_tracing(service_name: &str) {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) { "debug" } else { "info" }.to_string()
    });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Quiet the HTTP plumbing; our own crates stay at the requested level.
        format!(
            "{default_level},tower_http=warn,hyper=warn,libsql=error,tungstenite=warn"
        )
        .into()
    });

    if cfg!(debug_assertions) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true))
            .init();
    }

    let service_label = service_name.to_string();
    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic_info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic payload");

        error!(
            target: "panic_monitor",
            service = %service_label,
            location = %location,
            "[PANIC]: thread terminated abruptly: {message}"
        );
    }));

    info!("[TELEMETRY]: tracing online for {service_name}");
}

/// Reads a duration from the environment, accepting either plain seconds
/// (`"54"`) or suffixed values (`"54s"`, `"500ms"`, `"2m"`).
///
/// Unparseable or missing values fall back to `default`.
pub fn env_duration(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => parse_duration(raw.trim()).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Some(value) = raw.strip_suffix("ms") {
        return value.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(value) = raw.strip_suffix('s') {
        return value.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(value) = raw.strip_suffix('m') {
        return value
            .trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("54"), Some(Duration::from_secs(54)));
    }

    #[test]
    fn parses_suffixed_values() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10h"), None);
    }

    #[test]
    fn env_duration_falls_back_to_default() {
        let fallback = Duration::from_secs(60);
        assert_eq!(env_duration("KH_TEST_UNSET_DURATION", fallback), fallback);
    }
}
