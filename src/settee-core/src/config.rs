use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the base server URL
pub const URL_ENV_VAR: &str = "COUCHDB_URI";

/// Server URL used when neither configuration nor environment provide one
pub const DEFAULT_BASE_URL: &str = "http://localhost:5984/";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_url")]
    pub url: String,

    /// When disabled, requests carry `X-Couch-Full-Commit: false`
    #[serde(default = "default_true")]
    pub full_commit: bool,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry idempotent requests once when a reused idle connection turns out to be dead
    #[serde(default = "default_true")]
    pub retry_stale_connections: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Idle connections kept per (scheme, host:port); the oldest is closed on overflow
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of cached representations
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    /// Maximum total size of cached bodies, in bytes
    #[serde(default = "default_cache_bytes")]
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            max_bytes: default_cache_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub connect_ms: Option<u64>,

    /// Applies to fully-buffered requests only; streamed bodies are never cut off
    #[serde(default)]
    pub request_ms: Option<u64>,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Option<Duration> {
        self.connect_ms.map(Duration::from_millis)
    }

    pub fn request(&self) -> Option<Duration> {
        self.request_ms.map(Duration::from_millis)
    }
}

fn default_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_idle_per_host() -> usize {
    10
}

fn default_cache_entries() -> usize {
    75
}

fn default_cache_bytes() -> usize {
    4 * 1024 * 1024
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Defaults, with the server URL taken from `COUCHDB_URI` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            if !url.trim().is_empty() {
                config.url = url;
            }
        }
        config
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            full_commit: true,
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry_stale_connections: true,
        }
    }
}
