// Configuration shared by the stdio and HTTP front ends

use anyhow::{Context, Result};
use geoscope_core::{CachePolicy, LogLevel, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "GEOSCOPE_CONFIG";

pub const DEFAULT_CONFIG_FILE: &str = "geoscope.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub outbound: OutboundConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Upper bound on concurrent outbound calls; 0 means unlimited
    #[serde(default)]
    pub max_concurrent: usize,
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_jitter_ms() -> u64 {
    10
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            max_concurrent: 0,
        }
    }
}

impl OutboundConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent > 0).then_some(self.max_concurrent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_stale_grace_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            stale_grace_secs: default_stale_grace_secs(),
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(self.ttl_secs),
            stale_grace: Duration::from_secs(self.stale_grace_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Initial threshold for client-visible log messages
    #[serde(default = "default_level")]
    pub level: LogLevel,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebConfig {
    /// Domains `web_fetch` may reach; empty allows all
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Pages exposed as resources
    #[serde(default)]
    pub pinned_pages: Vec<Url>,
}

impl McpConfig {
    /// Load from `path`, falling back to defaults when the file is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_call_layer() {
        let config = McpConfig::default();

        assert_eq!(config.outbound.retry_config(), RetryConfig::default());
        assert_eq!(config.cache.policy(), CachePolicy::default());
        assert_eq!(config.outbound.concurrency_limit(), None);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_partial_file() {
        let config = McpConfig::from_toml(
            r#"
            [outbound]
            timeout_ms = 2500
            max_concurrent = 8

            [logging]
            level = "warn"

            [web]
            allowed_domains = ["example.com"]
            pinned_pages = ["https://example.com/pricing"]
            "#,
        )
        .unwrap();

        assert_eq!(config.outbound.retry_config().timeout, Duration::from_millis(2500));
        assert_eq!(config.outbound.max_retries, 2);
        assert_eq!(config.outbound.concurrency_limit(), Some(8));
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.web.pinned_pages[0].path(), "/pricing");
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_values_do_not_overflow() {
        let config = McpConfig::from_toml(
            r#"
            [outbound]
            base_delay_ms = 9223372036854775807
            max_jitter_ms = 9223372036854775807

            [cache]
            ttl_secs = 9223372036854775807
            stale_grace_secs = 9223372036854775807
            "#,
        )
        .unwrap();

        let retry = config.outbound.retry_config();
        assert!(retry.delay_for_attempt(3) >= retry.base_delay);

        let store = geoscope_core::CacheStore::with_policy(config.cache.policy());
        store.set_with_policy("k", 1u32, store.default_policy());
        assert_eq!(store.get_fresh("k"), Some(1));
    }

    #[test]
    fn test_rejects_unknown_level() {
        assert!(McpConfig::from_toml("[logging]\nlevel = \"verbose\"").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = McpConfig::load(Path::new("/nonexistent/geoscope.toml")).unwrap();
        assert_eq!(config, McpConfig::default());
    }
}
