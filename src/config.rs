//! Server configuration consumed read-only by the cache and fetch pipeline.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Sentinel storage value selecting the purely in-memory cache.
pub const MEMORY_SENTINEL: &str = ":memory:";

pub const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000;
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = 3;
pub const MAX_FETCH_ATTEMPTS: u32 = 10;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_DOCS_URL: &str = "https://docs.rs";
pub const DEFAULT_REGISTRY_URL: &str = "https://crates.io";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),

    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("Invalid {name} URL '{value}': {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Where cache entries live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageMode {
    #[default]
    Memory,
    /// Single-file durable store at the given path.
    Durable(PathBuf),
}

impl FromStr for StorageMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == MEMORY_SENTINEL {
            Ok(StorageMode::Memory)
        } else {
            Ok(StorageMode::Durable(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Memory => f.write_str(MEMORY_SENTINEL),
            StorageMode::Durable(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Immutable for the process lifetime; shared by reference with the cache
/// store and the fetcher at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub cache_ttl_ms: u64,
    pub max_cache_entries: usize,
    pub request_timeout_ms: u64,
    pub storage: StorageMode,
    pub docs_base_url: String,
    pub registry_base_url: String,
    pub max_fetch_attempts: u32,
    /// Interval of the background expiry sweep, `0` disables it.
    pub sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            storage: StorageMode::Memory,
            docs_base_url: DEFAULT_DOCS_URL.to_string(),
            registry_base_url: DEFAULT_REGISTRY_URL.to_string(),
            max_fetch_attempts: DEFAULT_MAX_FETCH_ATTEMPTS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl_ms == 0 {
            return Err(ConfigError::NotPositive("cache_ttl_ms"));
        }
        if self.max_cache_entries == 0 {
            return Err(ConfigError::NotPositive("max_cache_entries"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::NotPositive("request_timeout_ms"));
        }
        if self.max_fetch_attempts == 0 {
            return Err(ConfigError::NotPositive("max_fetch_attempts"));
        }
        if self.max_fetch_attempts > MAX_FETCH_ATTEMPTS {
            return Err(ConfigError::TooLarge {
                name: "max_fetch_attempts",
                value: u64::from(self.max_fetch_attempts),
                max: u64::from(MAX_FETCH_ATTEMPTS),
            });
        }
        check_url("docs", &self.docs_base_url)?;
        check_url("registry", &self.registry_base_url)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

fn check_url(name: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            name,
            value: value.to_string(),
            reason: "not a base URL".to_string(),
        });
    }
    Ok(())
}
