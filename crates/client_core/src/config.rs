use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Tunables for the conversation synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub history_limit: u32,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_grace_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub poll_interval_secs: u64,
    pub dedup_window_ms: u64,
    pub recent_send_capacity: usize,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            history_limit: 50,
            heartbeat_interval_secs: 25,
            heartbeat_grace_secs: 10,
            reconnect_delay_secs: 3,
            max_reconnect_attempts: 5,
            poll_interval_secs: 5,
            dedup_window_ms: 4_000,
            recent_send_capacity: 20,
            request_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence longer than this on an open channel is treated as a dead connection.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() + Duration::from_secs(self.heartbeat_grace_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn history_limit(&self) -> u32 {
        self.history_limit.clamp(1, 200)
    }

    pub fn recent_send_capacity(&self) -> usize {
        self.recent_send_capacity.max(1)
    }

    /// Upper bound for a single REST call, history loads included.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Loads settings from an optional TOML file, then applies `APP__*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings> {
    let mut settings = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
            parse_settings(&raw)
                .with_context(|| format!("invalid settings file '{}'", path.display()))?
        }
        None => SyncSettings::default(),
    };
    let env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with("APP__"))
        .collect();
    apply_env_overrides(&mut settings, &env);
    Ok(settings)
}

pub fn parse_settings(raw: &str) -> Result<SyncSettings> {
    Ok(toml::from_str::<SyncSettings>(raw)?)
}

fn apply_env_overrides(settings: &mut SyncSettings, env: &HashMap<String, String>) {
    fn parsed<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
        env.get(key).and_then(|v| v.trim().parse::<T>().ok())
    }

    if let Some(v) = parsed(env, "APP__HISTORY_LIMIT") {
        settings.history_limit = v;
    }
    if let Some(v) = parsed(env, "APP__HEARTBEAT_INTERVAL_SECS") {
        settings.heartbeat_interval_secs = v;
    }
    if let Some(v) = parsed(env, "APP__HEARTBEAT_GRACE_SECS") {
        settings.heartbeat_grace_secs = v;
    }
    if let Some(v) = parsed(env, "APP__RECONNECT_DELAY_SECS") {
        settings.reconnect_delay_secs = v;
    }
    if let Some(v) = parsed(env, "APP__MAX_RECONNECT_ATTEMPTS") {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = parsed(env, "APP__POLL_INTERVAL_SECS") {
        settings.poll_interval_secs = v;
    }
    if let Some(v) = parsed(env, "APP__DEDUP_WINDOW_MS") {
        settings.dedup_window_ms = v;
    }
    if let Some(v) = parsed(env, "APP__RECENT_SEND_CAPACITY") {
        settings.recent_send_capacity = v;
    }
    if let Some(v) = parsed(env, "APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
