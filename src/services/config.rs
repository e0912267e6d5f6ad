// src/services/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::core::session::SessionOptions;

pub const CONFIG_FILE: &str = "otto.toml";
pub const TOKEN_ENV: &str = "OTTO_TOKEN";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AccountConfig {
    pub name: Option<String>,
    /// Bearer token. Falls back to `OTTO_TOKEN`.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 0 disables the limit.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    /// Base URL published agents are served under.
    #[serde(default = "default_consumption_url")]
    pub consumption_url: String,
}

fn default_api_base_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_debounce_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_poll_timeout_ms() -> u64 {
    300_000
}
fn default_consumption_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            consumption_url: default_consumption_url(),
        }
    }
}

impl SessionConfig {
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            poll_timeout: (self.poll_timeout_ms > 0)
                .then(|| Duration::from_millis(self.poll_timeout_ms)),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OttoConfig {
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

impl OttoConfig {
    /// Load `otto.toml` from the working directory, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("{} not found, using defaults", path.display());
            return Ok(OttoConfig::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        debug!("Config loaded, API at {}", config.api.base_url);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Configured token, else the environment.
    pub fn token(&self) -> Option<String> {
        self.account
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()))
    }
}
