//! Configuration module for the log broadcaster.
//!
//! Configuration is read from a JSON file (named on the command line with
//! `-c`/`--config`) and validated into a [`Config`] before anything touches
//! the log file or the network.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

/// Default delay between poll cycles in milliseconds
const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Default delay between broadcast attempts in milliseconds
const DEFAULT_WAIT_MS: u64 = 1_000;

/// Default number of broadcast attempts per batch
const DEFAULT_ATTEMPTS: u32 = 1;

/// Default maximum number of events in one payload
const DEFAULT_MAX_EVENTS: usize = 32;

/// Default maximum serialized size of the events in one payload, in bytes
const DEFAULT_MAX_SIZE: usize = 65_535;

/// Default HTTP request timeout in milliseconds
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Minimum poll interval, to avoid hammering the file system
const MIN_INTERVAL_MS: u64 = 1_000;

/// Minimum delay between broadcast attempts
const MIN_WAIT_MS: u64 = 1_000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON or has unknown keys
    #[error("invalid JSON config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field failed validation
    #[error("configuration error for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// The configuration document as it appears on disk.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    url: String,
    #[serde(default = "default_interval")]
    interval: u64,
    log: String,
    #[serde(default)]
    new_only: bool,
    #[serde(default)]
    resume_path: Option<String>,
    #[serde(default = "default_wait")]
    wait: u64,
    #[serde(default = "default_attempts")]
    attempts: u32,
    #[serde(default = "default_max_events")]
    max_events: usize,
    #[serde(default = "default_max_size")]
    max_size: usize,
    #[serde(default = "default_request_timeout")]
    request_timeout: u64,
    #[serde(default)]
    retry_on_status: bool,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_wait() -> u64 {
    DEFAULT_WAIT_MS
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Validated configuration for one log source.
#[derive(Debug, Clone)]
pub struct Config {
    /// Collector endpoint that receives envelopes
    pub url: String,

    /// Delay between poll cycles
    pub interval: Duration,

    /// The newline-delimited JSON log file to tail
    pub log_path: PathBuf,

    /// Start from the end of the log instead of the beginning
    pub new_only: bool,

    /// Where the read offset is persisted; presence enables resume
    pub resume_path: Option<PathBuf>,

    /// Total number of POST attempts per batch
    pub attempts: u32,

    /// Delay between POST attempts
    pub wait: Duration,

    /// Maximum number of events in one envelope
    pub max_events: usize,

    /// Maximum cumulative serialized size of the events in one envelope
    pub max_size: usize,

    /// Timeout applied to each HTTP request
    pub request_timeout: Duration,

    /// Treat non-2xx responses as retryable failures
    pub retry_on_status: bool,
}

impl Config {
    /// Build a configuration with default settings for the given endpoint and log.
    pub fn new(url: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            log_path: log_path.into(),
            new_only: false,
            resume_path: None,
            attempts: DEFAULT_ATTEMPTS,
            wait: Duration::from_millis(DEFAULT_WAIT_MS),
            max_events: DEFAULT_MAX_EVENTS,
            max_size: DEFAULT_MAX_SIZE,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retry_on_status: false,
        }
    }

    /// Load and validate configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, is not valid JSON,
    /// contains unknown keys, or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;

        // An empty resume path means resume is disabled
        let resume_path = file
            .resume_path
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let config = Self {
            url: file.url,
            interval: Duration::from_millis(file.interval),
            log_path: PathBuf::from(file.log),
            new_only: file.new_only,
            resume_path,
            attempts: file.attempts,
            wait: Duration::from_millis(file.wait),
            max_events: file.max_events,
            max_size: file.max_size,
            request_timeout: Duration::from_millis(file.request_timeout),
            retry_on_status: file.retry_on_status,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::invalid("url", "must not be empty"));
        }

        let url = Url::parse(&self.url).map_err(|e| {
            ConfigError::invalid("url", format!("'{}' is not a valid URL: {}", self.url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::invalid(
                "url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        if self.log_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("log", "must not be empty"));
        }

        if self.interval < Duration::from_millis(MIN_INTERVAL_MS) {
            return Err(ConfigError::invalid(
                "interval",
                format!(
                    "interval {}ms is below minimum ({}ms)",
                    self.interval.as_millis(),
                    MIN_INTERVAL_MS
                ),
            ));
        }

        if self.wait < Duration::from_millis(MIN_WAIT_MS) {
            return Err(ConfigError::invalid(
                "wait",
                format!(
                    "wait {}ms is below minimum ({}ms)",
                    self.wait.as_millis(),
                    MIN_WAIT_MS
                ),
            ));
        }

        if self.attempts == 0 {
            return Err(ConfigError::invalid("attempts", "must be at least 1"));
        }

        if self.max_events == 0 {
            return Err(ConfigError::invalid("maxEvents", "must be greater than 0"));
        }

        if self.max_size == 0 {
            return Err(ConfigError::invalid("maxSize", "must be greater than 0"));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("requestTimeout", "must be greater than 0"));
        }

        Ok(())
    }

    /// Whether the read offset is persisted between runs.
    pub fn resume(&self) -> bool {
        self.resume_path.is_some()
    }
}
