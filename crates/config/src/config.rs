//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Number of long-lived workers draining the queue (minimum 1)
    #[serde(default = "default_worker_count")]
    pub count: u32,
}

fn default_worker_count() -> u32 {
    1
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
        }
    }
}

impl WorkersConfig {
    /// Worker count with the lower bound applied
    pub fn effective_count(&self) -> u32 {
        self.count.max(1)
    }
}

/// Status retention and sweeper timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Age after which a finished job's status is reclaimed
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between reclamation sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Pause taken by a worker after a job blew up at the loop boundary
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_failure_backoff_secs() -> u64 {
    5
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
        }
    }
}

/// Media fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    /// Directory for temporary downloads
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Netscape cookie file handed to yt-dlp
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            cookie_file: None,
        }
    }
}

/// Object storage destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible providers
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Base URL under which uploaded objects are publicly reachable
    #[serde(default)]
    pub public_url_base: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    /// True when access key, secret and bucket are all present and non-empty
    pub fn is_complete(&self) -> bool {
        [&self.access_key_id, &self.secret_access_key, &self.bucket]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

/// Download history and statistics files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    #[serde(default = "default_history_enabled")]
    pub enabled: bool,
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    #[serde(default = "default_stats_file")]
    pub stats_file: PathBuf,
}

fn default_history_enabled() -> bool {
    true
}

fn default_history_file() -> PathBuf {
    PathBuf::from("download_history.json")
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("stats.json")
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_history_enabled(),
            history_file: default_history_file(),
            stats_file: default_stats_file(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Read a non-empty environment variable
fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MAX_WORKERS -> workers.count
    /// - ENABLE_HISTORY -> history.enabled
    /// - COOKIE_FILE_PATH -> fetch.cookie_file
    /// - AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY -> storage credentials
    /// - AWS_S3_BUCKET_NAME -> storage.bucket
    /// - AWS_REGION -> storage.region
    /// - S3_ENDPOINT_URL -> storage.endpoint_url
    /// - S3_PUBLIC_URL_BASE -> storage.public_url_base
    /// - RELAY_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env_non_empty("MAX_WORKERS") {
            if let Ok(count) = val.trim().parse::<u32>() {
                self.workers.count = count;
            }
        }

        if let Some(val) = env_non_empty("ENABLE_HISTORY") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.history.enabled = true,
                "false" | "0" | "no" => self.history.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Some(val) = env_non_empty("COOKIE_FILE_PATH") {
            self.fetch.cookie_file = Some(PathBuf::from(val));
        }

        let storage_overrides = [
            ("AWS_ACCESS_KEY_ID", &mut self.storage.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &mut self.storage.secret_access_key),
            ("AWS_S3_BUCKET_NAME", &mut self.storage.bucket),
            ("AWS_REGION", &mut self.storage.region),
            ("S3_ENDPOINT_URL", &mut self.storage.endpoint_url),
            ("S3_PUBLIC_URL_BASE", &mut self.storage.public_url_base),
        ];
        for (key, slot) in storage_overrides {
            if let Some(val) = env_non_empty(key) {
                *slot = Some(val);
            }
        }

        if let Some(val) = env_non_empty("RELAY_BIND") {
            self.server.bind = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise start from defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
