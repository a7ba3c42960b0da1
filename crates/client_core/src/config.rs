use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{connection::RealtimeOptions, reconnect::ReconnectPolicy};

/// File used when no explicit config path is given and it exists in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub realtime_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reconnect_enabled: bool,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api".into(),
            realtime_url: "ws://127.0.0.1:8080/ws".into(),
            login_path: "/auth/login".into(),
            refresh_path: "/auth/refresh".into(),
            request_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            reconnect_enabled: true,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_attempts: 5,
            event_buffer: 1024,
        }
    }
}

impl ClientConfig {
    /// Defaults, then the TOML file (explicit path, or `client.toml` if present),
    /// then `APP__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("APP__API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("APP__REALTIME_URL") {
            self.realtime_url = v;
        }
        if let Some(v) = lookup("APP__LOGIN_PATH") {
            self.login_path = v;
        }
        if let Some(v) = lookup("APP__REFRESH_PATH") {
            self.refresh_path = v;
        }
        override_parsed(&lookup, "APP__REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        override_parsed(
            &lookup,
            "APP__HEARTBEAT_INTERVAL_SECS",
            &mut self.heartbeat_interval_secs,
        );
        override_parsed(&lookup, "APP__RECONNECT_ENABLED", &mut self.reconnect_enabled);
        override_parsed(
            &lookup,
            "APP__RECONNECT_BASE_DELAY_MS",
            &mut self.reconnect_base_delay_ms,
        );
        override_parsed(
            &lookup,
            "APP__RECONNECT_MAX_ATTEMPTS",
            &mut self.reconnect_max_attempts,
        );
    }

    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api_base_url '{}'", self.api_base_url))?;
        if !matches!(api.scheme(), "http" | "https") {
            bail!("api_base_url must start with http:// or https://");
        }
        let realtime = self.realtime_url()?;
        if !matches!(realtime.scheme(), "ws" | "wss") {
            bail!("realtime_url must start with ws:// or wss://");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than zero");
        }
        if self.reconnect_enabled && self.reconnect_base_delay_ms == 0 {
            bail!("reconnect_base_delay_ms must be greater than zero");
        }
        if self.event_buffer == 0 {
            bail!("event_buffer must be greater than zero");
        }
        Ok(())
    }

    pub fn realtime_url(&self) -> Result<Url> {
        Url::parse(&self.realtime_url)
            .with_context(|| format!("invalid realtime_url '{}'", self.realtime_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> Option<ReconnectPolicy> {
        self.reconnect_enabled.then(|| {
            ReconnectPolicy::new(
                Duration::from_millis(self.reconnect_base_delay_ms),
                self.reconnect_max_attempts,
            )
        })
    }

    pub fn realtime_options(&self) -> Result<RealtimeOptions> {
        Ok(RealtimeOptions {
            url: self.realtime_url()?,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            reconnect: self.reconnect_policy(),
        })
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparseable override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
