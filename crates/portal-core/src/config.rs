//! Application configuration management.
//!
//! This module handles loading and saving the portal configuration: the API
//! base URL, the request timeout, where the session is persisted and the
//! last email used to sign in.
//!
//! Configuration is stored at `~/.config/resell-portal/config.json`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{FileStorage, KeyringStorage, MemoryStorage, SessionStorage, STORAGE_NAMESPACE};

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API endpoint for local development
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

/// HTTP request timeout in seconds.
/// Exceeding it counts as a network failure and is retried with backoff.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "PORTAL_API_URL";

/// Environment variable overriding `session_backend`
pub const SESSION_BACKEND_ENV: &str = "PORTAL_SESSION_BACKEND";

/// Where the session is persisted between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SessionBackend::File),
            "keyring" => Ok(SessionBackend::Keyring),
            "memory" => Ok(SessionBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub session_backend: SessionBackend,
    #[serde(default)]
    pub last_email: Option<String>,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            session_backend: SessionBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
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

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(API_URL_ENV).ok(),
            std::env::var(SESSION_BACKEND_ENV).ok(),
        )
    }

    fn apply_overrides(&mut self, api_url: Option<String>, backend: Option<String>) -> Result<()> {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(backend) = backend {
            self.session_backend = backend
                .parse::<SessionBackend>()
                .with_context(|| format!("Invalid {}", SESSION_BACKEND_ENV))?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(STORAGE_NAMESPACE).join(CONFIG_FILE))
    }

    /// Directory for file-backed session storage
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(STORAGE_NAMESPACE))
    }

    /// Storage backend selected by `session_backend`
    pub fn session_storage(&self) -> Result<Arc<dyn SessionStorage>> {
        Ok(match self.session_backend {
            SessionBackend::File => Arc::new(FileStorage::new(self.data_dir()?)),
            SessionBackend::Keyring => Arc::new(KeyringStorage::new()),
            SessionBackend::Memory => Arc::new(MemoryStorage::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.session_backend, SessionBackend::File);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            api_base_url: "https://api.example.com".to_string(),
            session_backend: SessionBackend::Keyring,
            last_email: Some("ops@example.com".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.api_base_url, "https://api.example.com");
        assert_eq!(loaded.session_backend, SessionBackend::Keyring);
        assert_eq!(loaded.last_email.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"session_backend": "memory"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.session_backend, SessionBackend::Memory);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(Some("https://staging.example.com".into()), Some("Keyring".into()))
            .unwrap();
        assert_eq!(config.api_base_url, "https://staging.example.com");
        assert_eq!(config.session_backend, SessionBackend::Keyring);

        assert!(config.apply_overrides(None, Some("floppy".into())).is_err());
    }
}
