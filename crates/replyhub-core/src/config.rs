//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend and identity endpoints, the platform the core runs on, where the
//! session resume hint is stored, and timing policy.
//!
//! Configuration is stored at `~/.config/replyhub/config.json`. The backend
//! URL can be overridden per environment with `REPLYHUB_API_URL`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::ClientSettings;
use crate::auth::InteractiveSettings;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "replyhub";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when neither the environment nor the config file names one.
pub const DEFAULT_API_BASE_URL: &str = "https://api.replyhub.app";

pub const API_URL_ENV: &str = "REPLYHUB_API_URL";
pub const IDENTITY_API_KEY_ENV: &str = "REPLYHUB_IDENTITY_API_KEY";
pub const STORAGE_PASSPHRASE_ENV: &str = "REPLYHUB_STORAGE_PASSPHRASE";

const DEFAULT_REDIRECT_ORIGIN: &str = "https://app.replyhub.app";
const DEFAULT_REDIRECT_RETURN_PATH: &str = "/";

/// HTTP request deadline in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How long the session tolerates failed backend round trips before it is
/// marked expired.
const DEFAULT_OFFLINE_GRACE_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// No interactive sign-in (CLI, background services).
    #[default]
    Headless,
    /// Browser or desktop window: popup with redirect fallback.
    Windowed,
    /// Native account picker.
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Encrypted,
    Keyring,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub api_key: Option<String>,
    pub auth_base_url: Option<String>,
    pub token_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub identity: IdentityConfig,
    pub platform: Platform,
    pub redirect_origin: Option<String>,
    pub redirect_return_path: Option<String>,
    pub storage: StorageBackend,
    pub request_timeout_secs: u64,
    pub refresh_margin_minutes: i64,
    pub offline_grace_minutes: i64,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            identity: IdentityConfig::default(),
            platform: Platform::default(),
            redirect_origin: None,
            redirect_return_path: None,
            storage: StorageBackend::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_margin_minutes: crate::auth::session::TOKEN_REFRESH_BUFFER_MINUTES,
            offline_grace_minutes: DEFAULT_OFFLINE_GRACE_MINUTES,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
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

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the session resume hint and sign-in marker.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join("session"))
    }

    /// Backend base URL: environment, then config file, then the built-in default.
    pub fn api_base_url(&self) -> String {
        resolve_api_base_url(std::env::var(API_URL_ENV).ok(), self.api_base_url.as_deref())
    }

    pub fn identity_api_key(&self) -> Option<String> {
        std::env::var(IDENTITY_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.identity.api_key.clone())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.api_base_url(),
            request_timeout: std::time::Duration::from_secs(self.request_timeout_secs),
            offline_grace: chrono::Duration::minutes(self.offline_grace_minutes),
            ..ClientSettings::default()
        }
    }

    pub fn interactive_settings(&self) -> InteractiveSettings {
        InteractiveSettings {
            platform: self.platform,
            redirect_origin: self
                .redirect_origin
                .clone()
                .unwrap_or_else(|| DEFAULT_REDIRECT_ORIGIN.to_string()),
            redirect_return_path: self
                .redirect_return_path
                .clone()
                .unwrap_or_else(|| DEFAULT_REDIRECT_RETURN_PATH.to_string()),
        }
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.refresh_margin_minutes.max(0))
    }
}

pub fn resolve_api_base_url(env_value: Option<String>, configured: Option<&str>) -> String {
    let chosen = env_value
        .filter(|v| !v.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    chosen.trim().trim_end_matches('/').to_string()
}
