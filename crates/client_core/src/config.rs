use std::{fs, path::Path, time::Duration};

use serde::Serialize;
use tracing::warn;

use crate::{
    api::ApiClient,
    coordinator::{CoordinatorConfig, DEFAULT_POLL_INTERVAL},
    error::ClientError,
    event_log::{EventLogLimits, DEFAULT_EVENT_LOG_KEEP, DEFAULT_EVENT_LOG_MAX},
};

pub const SETTINGS_FILE: &str = "sync-monitor.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_reconnect_secs: Option<u64>,
    pub event_log_max: usize,
    pub event_log_keep: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".into(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            request_timeout_secs: 10,
            stream_reconnect_secs: None,
            event_log_max: DEFAULT_EVENT_LOG_MAX,
            event_log_keep: DEFAULT_EVENT_LOG_KEEP,
        }
    }
}

impl ClientSettings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            event_log_limits: EventLogLimits::new(self.event_log_max, self.event_log_keep),
            stream_reconnect_delay: self.stream_reconnect_secs.map(Duration::from_secs),
        }
    }

    pub fn build_client(&self) -> Result<ApiClient, ClientError> {
        ApiClient::with_timeout(
            &self.api_base_url,
            Duration::from_secs(self.request_timeout_secs.max(1)),
        )
    }
}

/// Defaults, then `sync-monitor.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    apply_file(&mut settings, Path::new(SETTINGS_FILE));
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_file(settings: &mut ClientSettings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    match raw.parse::<toml::Table>() {
        Ok(table) => apply_overrides(settings, |key| {
            let field = key.strip_prefix("APP__")?.to_ascii_lowercase();
            match table.get(&field)? {
                toml::Value::String(value) => Some(value.clone()),
                toml::Value::Integer(value) => Some(value.to_string()),
                _ => None,
            }
        }),
        Err(err) => warn!(path = %path.display(), error = %err, "ignoring unreadable settings file"),
    }
}

/// Applies `APP__*` style overrides from `lookup`. Values that do not parse are ignored.
pub fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SYNC_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = parsed(&lookup, "APP__POLL_INTERVAL_SECS") {
        settings.poll_interval_secs = v;
    }
    if let Some(v) = parsed(&lookup, "APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = parsed(&lookup, "APP__STREAM_RECONNECT_SECS") {
        settings.stream_reconnect_secs = Some(v);
    }
    if let Some(v) = parsed(&lookup, "APP__EVENT_LOG_MAX") {
        settings.event_log_max = v;
    }
    if let Some(v) = parsed(&lookup, "APP__EVENT_LOG_KEEP") {
        settings.event_log_keep = v;
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key)?.trim().parse().ok()
}
