use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub cache_database_url: String,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub history_limit: u32,
    pub probe_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            cache_database_url: "sqlite://./data/session_cache.db".into(),
            request_timeout_ms: 10_000,
            upload_timeout_ms: 30_000,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 10_000,
            history_limit: 50,
            probe_limit: 1,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }
}

/// Bounded exponential backoff used after an unexpected connection drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ClientSettings::default().reconnect_policy()
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Wait before reconnect `attempt`. When the first attempt runs immediately
    /// the backoff steps shift by one, so the second attempt waits `base_delay`.
    pub fn delay_before(&self, attempt: u32, immediate: bool) -> Option<Duration> {
        let step = if immediate { attempt.saturating_sub(1) } else { attempt };
        (step > 0).then(|| self.delay_for(step))
    }
}

/// Defaults, then `client.toml` (or `CARE_CHAT_CONFIG`), then environment overrides.
pub fn load_settings() -> ClientSettings {
    let path = std::env::var("CARE_CHAT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
    let mut settings = ClientSettings::default();
    apply_file_overrides(&mut settings, Path::new(&path));
    apply_env_overrides(&mut settings);
    settings.cache_database_url = normalize_database_url(&settings.cache_database_url);
    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
        Ok(file_cfg) => apply_overrides(settings, |key| {
            file_cfg.get(key).map(|value| match value {
                toml::Value::String(text) => text.clone(),
                other => other.to_string(),
            })
        }),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable client config: {err}");
        }
    }
}

fn apply_env_overrides(settings: &mut ClientSettings) {
    if let Ok(v) = std::env::var("CARE_CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CARE_CHAT_CACHE_DATABASE_URL") {
        settings.cache_database_url = v;
    }
    apply_overrides(settings, |key| {
        std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok()
    });
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("cache_database_url") {
        settings.cache_database_url = v;
    }
    set_parsed(&mut settings.request_timeout_ms, lookup("request_timeout_ms"));
    set_parsed(&mut settings.upload_timeout_ms, lookup("upload_timeout_ms"));
    set_parsed(
        &mut settings.reconnect_max_attempts,
        lookup("reconnect_max_attempts"),
    );
    set_parsed(
        &mut settings.reconnect_base_delay_ms,
        lookup("reconnect_base_delay_ms"),
    );
    set_parsed(
        &mut settings.reconnect_max_delay_ms,
        lookup("reconnect_max_delay_ms"),
    );
    set_parsed(&mut settings.history_limit, lookup("history_limit"));
    set_parsed(&mut settings.probe_limit, lookup("probe_limit"));
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(parsed) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        *slot = parsed;
    }
}

/// Normalizes a user supplied cache location into a sqlite url.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().cache_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
