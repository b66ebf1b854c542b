// ABOUTME: Configuration for correlated requests, project downloads and the service pool
//
// Defines Config with all tunable parameters:
// - Single-reply correlation timeout
// - Project download timeout and workspace root
// - Pool sizing, acquisition timeout, poll step, drain window, trial bound
//
// Loaded from TOML; durations are written in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default single-reply correlation timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default bound on a whole project download
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Smallest acceptable pool acquisition round timeout
pub const MIN_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default poll step for pool waits
pub const DEFAULT_POLL_STEP: Duration = Duration::from_millis(50);

/// Default drain window on pool dispose
pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_millis(5000);

/// Default number of acquisition rounds
pub const DEFAULT_MAX_TRIALS: u32 = 3;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BUSLINE_CONFIG";

// === Errors ===

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A parameter is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// === Sections ===

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Correlated request settings
    pub request: RequestConfig,

    /// Project download settings
    pub download: DownloadConfig,

    /// Service pool settings
    pub pool: PoolConfig,
}

/// Settings for single-reply correlated requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// How long to wait for the matching reply
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Settings for multi-phase project downloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Bound on a whole download session (manifest plus every file)
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Directory projects are materialized under (default: ~/.busline/workspace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            workspace_root: None,
        }
    }
}

impl DownloadConfig {
    /// Workspace root, falling back to `~/.busline/workspace`
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".busline")
                .join("workspace")
        })
    }
}

/// Settings for the worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool identifier, matched against the `service` field of broadcasts
    pub service_id: String,

    /// Workers provisioned at start-up; also the growth ceiling and the
    /// warm-up target
    pub pool_size: usize,

    /// Per-round wait for a ready worker and for bind confirmation
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,

    /// Upper bound between re-checks while waiting
    #[serde(with = "duration_millis")]
    pub poll_step: Duration,

    /// Time given to in-flight operations on dispose
    #[serde(with = "duration_millis")]
    pub drain_window: Duration,

    /// Acquisition rounds before giving up
    pub max_trials: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            service_id: "service".to_string(),
            pool_size: 1,
            acquire_timeout: MIN_ACQUIRE_TIMEOUT,
            poll_step: DEFAULT_POLL_STEP,
            drain_window: DEFAULT_DRAIN_WINDOW,
            max_trials: DEFAULT_MAX_TRIALS,
        }
    }
}

impl PoolConfig {
    /// Create a config for a service with default timings
    pub fn for_service(service_id: impl Into<String>, pool_size: usize) -> Self {
        Self {
            service_id: service_id.into(),
            pool_size,
            ..Self::default()
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_id.trim().is_empty() {
            return Err(ConfigError::Invalid("pool.service_id must not be empty".to_string()));
        }
        if self.acquire_timeout < MIN_ACQUIRE_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "pool.acquire_timeout cannot be smaller than {} milliseconds",
                MIN_ACQUIRE_TIMEOUT.as_millis()
            )));
        }
        if self.poll_step.is_zero() || self.poll_step > self.acquire_timeout {
            return Err(ConfigError::Invalid(
                "pool.poll_step must be positive and not exceed pool.acquire_timeout".to_string(),
            ));
        }
        if self.max_trials == 0 {
            return Err(ConfigError::Invalid("pool.max_trials must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load from `$BUSLINE_CONFIG`, then `~/.busline/config.toml`, else defaults
    pub fn load_or_default() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".busline").join("config.toml"))
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request.timeout.is_zero() {
            return Err(ConfigError::Invalid("request.timeout must be positive".to_string()));
        }
        if self.download.timeout.is_zero() {
            return Err(ConfigError::Invalid("download.timeout must be positive".to_string()));
        }
        self.pool.validate()
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
