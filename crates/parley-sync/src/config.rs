//! Sync engine configuration loaded from environment variables.
//!
//! Every setting has a default so a local development server works with
//! zero configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use parley_shared::constants::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PULL_LIMIT, DEFAULT_RETENTION_DAYS, PULL_DEBOUNCE_SECS,
    REQUEST_TIMEOUT_SECS, SEND_DEBOUNCE_MS, SYNC_INTERVAL_SECS, UPLOAD_TIMEOUT_SECS,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST message API.
    /// Env: `PARLEY_API_URL`
    /// Default: `http://localhost:3000/api`
    pub api_url: String,

    /// WebSocket endpoint of the real-time channel.
    /// Env: `PARLEY_REALTIME_URL`
    /// Default: derived from `api_url` (`ws[s]://…/realtime`).
    pub realtime_url: Option<String>,

    /// Database file. Env: `PARLEY_DB_PATH`. Default: platform data dir.
    pub db_path: Option<PathBuf>,

    /// Handle of the local user. Env: `PARLEY_USERNAME`
    pub username: String,

    /// Bearer token. Env: `PARLEY_TOKEN`. Default: none.
    pub token: Option<String>,

    /// Env: `PARLEY_SYNC_INTERVAL_SECS`
    pub sync_interval: Duration,

    /// Env: `PARLEY_PULL_DEBOUNCE_SECS`
    pub pull_debounce: Duration,

    /// Env: `PARLEY_SEND_DEBOUNCE_MS`
    pub send_debounce: Duration,

    /// Env: `PARLEY_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,

    /// Env: `PARLEY_UPLOAD_TIMEOUT_SECS`
    pub upload_timeout: Duration,

    /// Replay ceiling for sync-queue items. Env: `PARLEY_MAX_ATTEMPTS`
    pub max_attempts: u32,

    /// Local retention in days, 0 keeps everything.
    /// Env: `PARLEY_RETENTION_DAYS`
    pub retention_days: u32,

    /// Page size of a pull. Env: `PARLEY_PULL_LIMIT`
    pub pull_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/api".to_string(),
            realtime_url: None,
            db_path: None,
            username: "guest".to_string(),
            token: None,
            sync_interval: Duration::from_secs(SYNC_INTERVAL_SECS),
            pull_debounce: Duration::from_secs(PULL_DEBOUNCE_SECS),
            send_debounce: Duration::from_millis(SEND_DEBOUNCE_MS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            upload_timeout: Duration::from_secs(UPLOAD_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retention_days: DEFAULT_RETENTION_DAYS,
            pull_limit: DEFAULT_PULL_LIMIT,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_API_URL") {
            match Url::parse(&url) {
                Ok(_) => config.api_url = url,
                Err(e) => tracing::warn!(value = %url, error = %e, "Invalid PARLEY_API_URL, using default"),
            }
        }

        if let Some(url) = lookup("PARLEY_REALTIME_URL") {
            if !url.is_empty() {
                config.realtime_url = Some(url);
            }
        }

        if let Some(path) = lookup("PARLEY_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(name) = lookup("PARLEY_USERNAME") {
            if !name.trim().is_empty() {
                config.username = name.trim().to_string();
            }
        }

        if let Some(token) = lookup("PARLEY_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_PULL_DEBOUNCE_SECS") {
            config.pull_debounce = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PARLEY_SEND_DEBOUNCE_MS") {
            config.send_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PARLEY_UPLOAD_TIMEOUT_SECS") {
            config.upload_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse_var::<u32>(&lookup, "PARLEY_MAX_ATTEMPTS") {
            config.max_attempts = n.max(1);
        }
        if let Some(days) = parse_var::<u32>(&lookup, "PARLEY_RETENTION_DAYS") {
            config.retention_days = days;
        }
        if let Some(n) = parse_var::<u32>(&lookup, "PARLEY_PULL_LIMIT") {
            config.pull_limit = n.max(1);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// The configured real-time endpoint, or one derived from the API URL
    /// by swapping the scheme and appending `/realtime`.
    pub fn realtime_endpoint(&self) -> Result<String, url::ParseError> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.clone());
        }
        let mut url = Url::parse(&self.api_url)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always an allowed scheme change.
        let _ = url.set_scheme(scheme);
        let path = format!("{}/realtime", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url.to_string())
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        (self.retention_days > 0).then(|| chrono::Duration::days(i64::from(self.retention_days)))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> SyncConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.pull_debounce, Duration::from_secs(10));
        assert_eq!(config.send_debounce, Duration::from_millis(300));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retention(), Some(chrono::Duration::days(30)));
    }

    #[test]
    fn test_env_overrides_and_invalid_values() {
        let config = from_pairs(&[
            ("PARLEY_API_URL", "https://chat.example.com/api/"),
            ("PARLEY_USERNAME", " alice "),
            ("PARLEY_MAX_ATTEMPTS", "5"),
            ("PARLEY_PULL_LIMIT", "lots"),
            ("PARLEY_RETENTION_DAYS", "0"),
        ]);
        assert_eq!(config.username, "alice");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.pull_limit, DEFAULT_PULL_LIMIT);
        assert_eq!(config.retention(), None);

        let bad = from_pairs(&[("PARLEY_API_URL", "not a url")]);
        assert_eq!(bad.api_url, SyncConfig::default().api_url);
    }

    #[test]
    fn test_realtime_endpoint_derivation() {
        let config = from_pairs(&[("PARLEY_API_URL", "https://chat.example.com/api/")]);
        assert_eq!(
            config.realtime_endpoint().unwrap(),
            "wss://chat.example.com/api/realtime"
        );

        let explicit = from_pairs(&[("PARLEY_REALTIME_URL", "ws://10.0.0.2:9000/socket")]);
        assert_eq!(explicit.realtime_endpoint().unwrap(), "ws://10.0.0.2:9000/socket");
    }
}
