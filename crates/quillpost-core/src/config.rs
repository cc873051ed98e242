//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: API
//! location, request and retry tuning, session lifetime limits, and how the
//! session is persisted.
//!
//! Configuration is stored at `~/.config/quillpost/config.json`. Any field can
//! be overridden with a `QUILLPOST_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "quillpost";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_REFRESH_THRESHOLD_MINUTES: i64 = 5;
const DEFAULT_MAX_SESSION_AGE_DAYS: i64 = 7;

/// Upper bounds for the duration settings; larger values are clamped.
const MAX_REFRESH_THRESHOLD_MINUTES: i64 = 24 * 60;
const MAX_SESSION_AGE_DAYS: i64 = 100 * 365;

/// The blog owner account. Admin-only views are restricted to this user.
const DEFAULT_ADMIN_USER_ID: i64 = 1;

/// Where the session is kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Written to disk, survives restarts
    #[default]
    Durable,
    /// Held in memory for the lifetime of the process only
    Session,
}

impl FromStr for Persistence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" | "local" => Ok(Persistence::Durable),
            "session" | "memory" => Ok(Persistence::Session),
            other => Err(format!("unknown persistence scope: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub refresh_threshold_minutes: i64,
    pub max_session_age_days: i64,
    pub encryption_enabled: bool,
    /// Passphrase for session encryption. When absent a random key is kept
    /// in the OS keychain instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub persistence: Persistence,
    pub admin_user_id: i64,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            refresh_threshold_minutes: DEFAULT_REFRESH_THRESHOLD_MINUTES,
            max_session_age_days: DEFAULT_MAX_SESSION_AGE_DAYS,
            encryption_enabled: true,
            encryption_key: None,
            persistence: Persistence::Durable,
            admin_user_id: DEFAULT_ADMIN_USER_ID,
            last_username: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if missing), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `QUILLPOST_*` overrides using the given variable lookup.
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("QUILLPOST_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_RETRY_COUNT") {
            self.retry_count = v;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_REFRESH_THRESHOLD_MINUTES") {
            self.refresh_threshold_minutes = v;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_MAX_SESSION_AGE_DAYS") {
            self.max_session_age_days = v;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_ENCRYPTION_ENABLED") {
            self.encryption_enabled = v;
        }
        if let Some(key) = lookup("QUILLPOST_ENCRYPTION_KEY").filter(|k| !k.is_empty()) {
            self.encryption_key = Some(key);
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_PERSISTENCE") {
            self.persistence = v;
        }
        if let Some(v) = parse_override(&lookup, "QUILLPOST_ADMIN_USER_ID") {
            self.admin_user_id = v;
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::minutes(
            self.refresh_threshold_minutes
                .clamp(0, MAX_REFRESH_THRESHOLD_MINUTES),
        )
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::days(self.max_session_age_days.clamp(0, MAX_SESSION_AGE_DAYS))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session and log files.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

fn parse_override<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(variable = name, error = %e, "Ignoring invalid config override");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
