//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: backend
//! URL, poll interval, refresh provider, keychain service name, and the last
//! identifier used to sign in.
//!
//! Configuration is stored at `~/.config/diaryline/config.json`. The
//! `DIARYLINE_BASE_URL` and `DIARYLINE_POLL_INTERVAL_MS` environment
//! variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::DEFAULT_REFRESH_PROVIDER;
use crate::auth::DEFAULT_SERVICE_NAME;
use crate::poller::DEFAULT_POLL_INTERVAL;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "diaryline";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured (local docker-compose port)
pub const DEFAULT_BASE_URL: &str = "http://localhost:7078";

const BASE_URL_ENV: &str = "DIARYLINE_BASE_URL";
const POLL_INTERVAL_ENV: &str = "DIARYLINE_POLL_INTERVAL_MS";

/// Polls faster than this would hammer the backend.
const MIN_POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub refresh_provider: String,
    pub keyring_service: String,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            refresh_provider: DEFAULT_REFRESH_PROVIDER.to_string(),
            keyring_service: DEFAULT_SERVICE_NAME.to_string(),
            last_identifier: None,
        }
    }
}

impl Config {
    /// Load from the user config directory, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(
            std::env::var(BASE_URL_ENV).ok(),
            std::env::var(POLL_INTERVAL_ENV).ok(),
        )?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides (normally from the environment). Empty values are ignored.
    pub fn apply_overrides(
        &mut self,
        base_url: Option<String>,
        poll_interval_ms: Option<String>,
    ) -> Result<()> {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(ms) = poll_interval_ms.filter(|v| !v.trim().is_empty()) {
            self.poll_interval_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {:?}", POLL_INTERVAL_ENV, ms))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base URL {:?}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Base URL must be http or https: {}", self.base_url);
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            anyhow::bail!(
                "Poll interval must be at least {} ms (got {})",
                MIN_POLL_INTERVAL_MS,
                self.poll_interval_ms
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for log files and other disposable state
    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
