//! Configuration management for the tokenrelay client and CLI

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{RelayError, Result};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";
pub const DEFAULT_LOGOUT_PATH: &str = "/auth/logout";

/// Tokens whose remaining lifetime drops under this many seconds are renewed before use.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 5 * 60;
const MAX_REFRESH_THRESHOLD_SECS: u64 = 30 * 24 * 60 * 60;

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tokenrelay")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.json")
}

pub fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tokenrelay")
}

pub fn default_token_path() -> PathBuf {
    default_storage_dir().join("tokens.json")
}

/// Token storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenStorageConfig {
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_storage_enabled() -> bool {
    true
}

impl Default for TokenStorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            storage_path: None,
            encryption_key: None,
        }
    }
}

impl TokenStorageConfig {
    /// Path of the token file, falling back to the platform data directory
    pub fn resolved_path(&self) -> PathBuf {
        self.storage_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_token_path)
    }
}

impl From<TokenStorageConfig> for crate::store::FileStorageConfig {
    fn from(config: TokenStorageConfig) -> Self {
        Self {
            storage_path: config.resolved_path(),
            encryption_key: config.encryption_key.filter(|k| !k.is_empty()),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_use_proxy")]
    pub use_proxy: bool,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_logout_path")]
    pub logout_path: String,
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
    #[serde(default)]
    pub token_storage: TokenStorageConfig,
}

fn default_timeout() -> u64 {
    30
}

fn default_use_proxy() -> bool {
    true
}

fn default_refresh_path() -> String {
    DEFAULT_REFRESH_PATH.to_string()
}

fn default_login_path() -> String {
    DEFAULT_LOGIN_PATH.to_string()
}

fn default_logout_path() -> String {
    DEFAULT_LOGOUT_PATH.to_string()
}

fn default_refresh_threshold_secs() -> u64 {
    DEFAULT_REFRESH_THRESHOLD_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: default_timeout(),
            use_proxy: default_use_proxy(),
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            logout_path: default_logout_path(),
            refresh_threshold_secs: default_refresh_threshold_secs(),
            token_storage: TokenStorageConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Layer defaults, an optional JSON file and `TOKENRELAY_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `TOKENRELAY_TOKEN_STORAGE__ENABLED=false`.
    pub fn from_file_and_env<P: AsRef<Path>>(config_file: Option<P>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("base_url", DEFAULT_BASE_URL)?
            .set_default("timeout", default_timeout())?
            .set_default("use_proxy", default_use_proxy())?
            .set_default("refresh_path", DEFAULT_REFRESH_PATH)?
            .set_default("login_path", DEFAULT_LOGIN_PATH)?
            .set_default("logout_path", DEFAULT_LOGOUT_PATH)?
            .set_default("refresh_threshold_secs", DEFAULT_REFRESH_THRESHOLD_SECS)?;

        if let Some(config_path) = config_file {
            if config_path.as_ref().exists() {
                builder = builder.add_source(File::from(config_path.as_ref()));
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("TOKENRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from the given file, or the default location when `None`
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        let config = Self::from_file_and_env(Some(&path))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(RelayError::invalid_input("Base URL cannot be empty"));
        }
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| RelayError::invalid_endpoint(format!("{}: {}", self.base_url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RelayError::invalid_endpoint(format!(
                "Unsupported scheme '{}' in base URL",
                url.scheme()
            )));
        }
        if self.refresh_path.trim().is_empty() {
            return Err(RelayError::invalid_input("Refresh path cannot be empty"));
        }
        if self.timeout == 0 {
            return Err(RelayError::invalid_input("Timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        let endpoint = endpoint.strip_prefix('/').unwrap_or(endpoint);
        format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_threshold_secs.min(MAX_REFRESH_THRESHOLD_SECS) as i64)
    }

    /// Whether `endpoint` addresses the token refresh endpoint
    pub fn is_refresh_endpoint(&self, endpoint: &str) -> bool {
        normalize_path(endpoint) == normalize_path(&self.refresh_path)
    }
}

fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    path.trim_matches('/')
}
