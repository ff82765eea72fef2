//! Runtime configuration read from `PULSE_*` environment variables.

use garde::Validate;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
const DEFAULT_PUBLISH_BACKOFF_MS: u64 = 500;
const MAX_API_URL_LENGTH: usize = 2048;
const DB_FILE_NAME: &str = "keys.db";

/// Where identity keys are persisted on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Keyring,
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "keyring" => Some(Self::Keyring),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Caller-side retry for publishing a public key to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_PUBLISH_BACKOFF_MS),
        }
    }
}

/// Custom validation for the directory base URL
fn validate_api_url(value: &str, _ctx: &()) -> garde::Result {
    match url::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(_) => Err(garde::Error::new("must be an http or https URL")),
        Err(_) => Err(garde::Error::new("not a valid URL")),
    }
}

#[derive(Debug, Clone, Validate)]
#[garde(context(()))]
pub struct Config {
    #[garde(length(min = 1, max = MAX_API_URL_LENGTH), custom(validate_api_url))]
    pub api_url: String,
    #[garde(skip)]
    pub store: StoreBackend,
    /// Always set for the SQLite backend; other backends never touch the disk.
    #[garde(skip)]
    pub data_dir: Option<PathBuf>,
    #[garde(range(min = 1, max = 300))]
    pub http_timeout_secs: u64,
    #[garde(range(min = 1, max = 10))]
    pub publish_attempts: u32,
    #[garde(range(max = 60_000))]
    pub publish_backoff_ms: u64,
    #[garde(skip)]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let store = match var("PULSE_KEY_STORE") {
            Some(value) => StoreBackend::parse(&value).ok_or(ConfigError::InvalidVar {
                name: "PULSE_KEY_STORE",
                value,
            })?,
            None => StoreBackend::Sqlite,
        };

        let data_dir = match (var("PULSE_DATA_DIR"), store) {
            (Some(dir), _) => Some(PathBuf::from(dir)),
            (None, StoreBackend::Sqlite) => {
                Some(default_data_dir().ok_or(ConfigError::NoDataDir)?)
            }
            (None, _) => None,
        };

        let config = Self {
            api_url: var("PULSE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            store,
            data_dir,
            http_timeout_secs: parse_number(
                "PULSE_HTTP_TIMEOUT_SECS",
                var("PULSE_HTTP_TIMEOUT_SECS"),
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?,
            publish_attempts: parse_number(
                "PULSE_PUBLISH_ATTEMPTS",
                var("PULSE_PUBLISH_ATTEMPTS"),
                DEFAULT_PUBLISH_ATTEMPTS,
            )?,
            publish_backoff_ms: parse_number(
                "PULSE_PUBLISH_BACKOFF_MS",
                var("PULSE_PUBLISH_BACKOFF_MS"),
                DEFAULT_PUBLISH_BACKOFF_MS,
            )?,
            log_dir: var("PULSE_LOG_DIR").map(PathBuf::from),
        };

        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_attempts,
            backoff: Duration::from_millis(self.publish_backoff_ms),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(DB_FILE_NAME))
            .ok_or(ConfigError::NoDataDir)
    }
}

fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "pulse", "pulse-chat")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        None => Ok(default),
    }
}
