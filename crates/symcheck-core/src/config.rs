//! Application configuration management.
//!
//! Holds the API location, timeouts, where credentials are kept and the last
//! used email. Stored at `~/.config/symcheck/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "symcheck";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `api_base_url` when set
pub const API_URL_ENV: &str = "SYMCHECK_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:5000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

/// Where the credential store keeps tokens between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// `credentials.json` in the per-origin cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Nothing survives the process
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    /// Some backends answer an expired JWT with 422 instead of 401
    pub treat_422_as_auth_failure: bool,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            credential_backend: CredentialBackend::default(),
            treat_422_as_auth_failure: true,
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

    /// Apply `SYMCHECK_API_URL` if it is set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                debug!(url = %url, "API URL overridden from environment");
                self.api_base_url = url.trim().to_string();
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Scheme, host and port of the API; credentials are scoped to it.
    pub fn origin(&self) -> Result<String> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid API URL: {}", self.api_base_url))?;
        if url.cannot_be_a_base() || url.host().is_none() {
            anyhow::bail!("API URL has no host: {}", self.api_base_url);
        }
        Ok(url.origin().ascii_serialization())
    }

    /// Root cache directory, shared by every origin
    pub fn cache_root() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Per-origin cache directory, e.g. `~/.cache/symcheck/http_localhost_5000`
    pub fn cache_dir(&self) -> Result<PathBuf> {
        Ok(Self::cache_root()?.join(origin_dir_name(&self.origin()?)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Open the credential store for this origin with the configured backend.
    pub fn open_credential_store(&self) -> Result<CredentialStore> {
        let store = match self.credential_backend {
            CredentialBackend::File => CredentialStore::open(FileBackend::new(self.cache_dir()?)),
            CredentialBackend::Keyring => CredentialStore::open(KeyringBackend::new(&self.origin()?)),
            CredentialBackend::Memory => CredentialStore::open(MemoryBackend::new()),
        };
        Ok(store)
    }
}

fn origin_dir_name(origin: &str) -> String {
    origin
        .replace("://", "_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
