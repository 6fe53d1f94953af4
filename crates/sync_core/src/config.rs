use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::protocol::topics;
use thiserror::Error;
use tracing::warn;
use url::Url;

const SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub base_url: String,
    pub ws_path: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub cache_ttl_ms: u64,
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub debounce_ms: u64,
    pub dedup_window_ms: u64,
    pub recent_retention_ms: u64,
    pub critical_topics: Vec<String>,
    pub excluded_pages: Vec<String>,
    pub low_priority_pages: Vec<String>,
    pub rejoin_rooms_on_reconnect: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".into(),
            ws_path: "/ws".into(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            cache_ttl_ms: 5 * 60 * 1_000,
            min_interval_ms: 1_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            debounce_ms: 300,
            dedup_window_ms: 2_000,
            recent_retention_ms: 10_000,
            critical_topics: vec![
                topics::RECEIVE_MESSAGE.to_string(),
                topics::MATCH_UPDATE.to_string(),
            ],
            excluded_pages: vec!["/login".into(), "/register".into(), "/settings".into()],
            low_priority_pages: vec!["/profile".into(), "/shop".into()],
            rejoin_rooms_on_reconnect: false,
        }
    }
}

impl SyncSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn recent_retention(&self) -> Duration {
        Duration::from_millis(self.recent_retention_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// WebSocket endpoint derived from the HTTP base url.
    pub fn channel_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason,
        };
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(invalid("base url must start with http:// or https://".into()));
        };
        let path = if self.ws_path.starts_with('/') {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        };
        Url::parse(&format!("{ws_base}{path}")).map_err(|err| invalid(err.to_string()))
    }
}

pub fn load_settings() -> SyncSettings {
    let mut settings = load_settings_file(Path::new(SETTINGS_FILE)).unwrap_or_default();
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn load_settings_file(path: &Path) -> Option<SyncSettings> {
    let raw = fs::read_to_string(path).ok()?;
    match toml::from_str::<SyncSettings>(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "config: ignoring unparsable settings file"
            );
            None
        }
    }
}

fn apply_env_overrides(settings: &mut SyncSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SYNC_BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = var("APP__BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = var("APP__WS_PATH") {
        settings.ws_path = v;
    }

    override_parsed(&var, "APP__RECONNECT_ATTEMPTS", &mut settings.reconnect_attempts);
    override_parsed(&var, "APP__RECONNECT_DELAY_MS", &mut settings.reconnect_delay_ms);
    override_parsed(&var, "APP__CACHE_TTL_MS", &mut settings.cache_ttl_ms);
    override_parsed(&var, "APP__MIN_INTERVAL_MS", &mut settings.min_interval_ms);
    override_parsed(&var, "APP__MAX_RETRIES", &mut settings.max_retries);
    override_parsed(&var, "APP__RETRY_DELAY_MS", &mut settings.retry_delay_ms);
    override_parsed(&var, "APP__DEBOUNCE_MS", &mut settings.debounce_ms);
    override_parsed(&var, "APP__DEDUP_WINDOW_MS", &mut settings.dedup_window_ms);
    override_parsed(
        &var,
        "APP__RECENT_RETENTION_MS",
        &mut settings.recent_retention_ms,
    );
    override_parsed(
        &var,
        "APP__REJOIN_ROOMS_ON_RECONNECT",
        &mut settings.rejoin_rooms_on_reconnect,
    );
}

fn override_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = var(key) {
        match raw.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %raw, "config: ignoring unparsable override"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
