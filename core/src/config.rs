//! Configuration management for Tern Mail

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{TernError, TernResult};

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Sync settings
    pub sync: SyncConfig,
    /// Provider credentials and endpoints
    pub providers: ProvidersConfig,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level
    pub log_level: String,
    /// Configuration directory
    pub config_dir: PathBuf,
    /// Data directory
    pub data_dir: PathBuf,
    /// Database file name, relative to `data_dir`
    pub database_file: String,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Background sync interval (seconds)
    pub sync_interval: u64,
    /// Maximum concurrent account syncs
    pub max_concurrent_syncs: usize,
    /// Upper bound for a single run (seconds)
    pub run_timeout: u64,
    /// Messages requested per provider page
    pub page_size: u32,
    /// Pause between pages (milliseconds)
    pub page_delay_ms: u64,
    /// Window of the first sync of a new account (days)
    pub initial_sync_days: u32,
    /// Retries after a throttled or failed request
    pub max_retries: u32,
    /// First backoff delay (seconds), doubled on each retry
    pub retry_base_delay: u64,
    /// Longest delay ever slept, including `Retry-After` (seconds)
    pub retry_max_delay: u64,
    /// Refresh access tokens expiring within this margin (seconds)
    pub refresh_margin: u64,
}

/// OAuth client registration for one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl OAuthClientConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
    }
}

/// Provider credentials and API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub google: OAuthClientConfig,
    pub microsoft: OAuthClientConfig,
    pub aurinko: OAuthClientConfig,
    /// Gmail REST base, e.g. `https://gmail.googleapis.com/gmail/v1/users/me`
    pub gmail_api_base: String,
    /// Microsoft Graph base, e.g. `https://graph.microsoft.com/v1.0`
    pub graph_api_base: String,
    /// Aurinko API base, e.g. `https://api.aurinko.io/v1`
    pub aurinko_api_base: String,
    pub google_token_url: String,
    pub microsoft_token_url: String,
    /// Aurinko code exchange endpoint; the code is appended as a path segment
    pub aurinko_token_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            config_dir: crate::get_config_dir().unwrap_or_else(|_| PathBuf::from("~/.config/tern-mail")),
            data_dir: crate::get_data_dir().unwrap_or_else(|_| PathBuf::from("~/.local/share/tern-mail")),
            database_file: crate::DB_FILENAME.to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: crate::DEFAULT_SYNC_INTERVAL,
            max_concurrent_syncs: 3,
            run_timeout: 600, // 10 minutes
            page_size: 50,
            page_delay_ms: 300,
            initial_sync_days: 30,
            max_retries: 3,
            retry_base_delay: 2,
            retry_max_delay: 300,
            refresh_margin: 300, // 5 minutes
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            google: OAuthClientConfig::default(),
            microsoft: OAuthClientConfig::default(),
            aurinko: OAuthClientConfig::default(),
            gmail_api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            graph_api_base: "https://graph.microsoft.com/v1.0".to_string(),
            aurinko_api_base: "https://api.aurinko.io/v1".to_string(),
            google_token_url: "https://oauth2.googleapis.com/token".to_string(),
            microsoft_token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            aurinko_token_url: "https://api.aurinko.io/v1/auth/token".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin)
    }
}

fn env_flag<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: &Path) -> TernResult<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &Path) -> TernResult<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Load defaults and apply `TERN_*` environment overrides
    pub fn load_from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Apply `TERN_*` environment overrides on top of this configuration
    pub fn apply_env(&mut self) {
        if let Ok(log_level) = std::env::var("TERN_LOG_LEVEL") {
            self.app.log_level = log_level;
        }

        if let Ok(data_dir) = std::env::var("TERN_DATA_DIR") {
            self.app.data_dir = PathBuf::from(data_dir);
        }

        if let Some(interval) = env_flag("TERN_SYNC_INTERVAL_SECONDS") {
            self.sync.sync_interval = interval;
        }

        if let Some(syncs) = env_flag("TERN_MAX_CONCURRENT_SYNCS") {
            self.sync.max_concurrent_syncs = syncs;
        }

        if let Some(days) = env_flag("TERN_INITIAL_SYNC_DAYS") {
            self.sync.initial_sync_days = days;
        }

        if let Some(delay) = env_flag("TERN_PAGE_DELAY_MS") {
            self.sync.page_delay_ms = delay;
        }

        for (client, prefix) in [
            (&mut self.providers.google, "TERN_GOOGLE"),
            (&mut self.providers.microsoft, "TERN_MICROSOFT"),
            (&mut self.providers.aurinko, "TERN_AURINKO"),
        ] {
            if let Ok(id) = std::env::var(format!("{}_CLIENT_ID", prefix)) {
                client.client_id = id;
            }
            if let Ok(secret) = std::env::var(format!("{}_CLIENT_SECRET", prefix)) {
                client.client_secret = secret;
            }
            if let Ok(uri) = std::env::var(format!("{}_REDIRECT_URI", prefix)) {
                client.redirect_uri = uri;
            }
        }
    }

    /// Get the configuration file path
    pub fn config_file_path(&self) -> PathBuf {
        self.app.config_dir.join("config.toml")
    }

    /// Get the database file path
    pub fn database_file_path(&self) -> PathBuf {
        self.app.data_dir.join(&self.app.database_file)
    }

    /// Validate the configuration
    pub fn validate(&self) -> TernResult<()> {
        if !self.app.data_dir.exists() {
            std::fs::create_dir_all(&self.app.data_dir)
                .map_err(|_| TernError::DataDirCreateFailed(self.app.data_dir.clone()))?;
        }

        if self.app.database_file.trim().is_empty() {
            return Err(TernError::config("Database file name cannot be empty"));
        }

        if self.sync.sync_interval == 0 {
            return Err(TernError::config("Sync interval cannot be zero"));
        }

        if self.sync.max_concurrent_syncs == 0 {
            return Err(TernError::config("Max concurrent syncs cannot be zero"));
        }

        if self.sync.page_size == 0 {
            return Err(TernError::config("Page size cannot be zero"));
        }

        if self.sync.initial_sync_days == 0 {
            return Err(TernError::config("Initial sync window cannot be zero days"));
        }

        if self.sync.retry_base_delay > self.sync.retry_max_delay {
            return Err(TernError::config("Retry base delay exceeds the maximum delay"));
        }

        for base in [
            &self.providers.gmail_api_base,
            &self.providers.graph_api_base,
            &self.providers.aurinko_api_base,
        ] {
            url::Url::parse(base)?;
        }

        Ok(())
    }
}
