//! Service configuration.
//!
//! Built from [`ServiceConfig::default`], a JSON file, or `MARGIN_*`
//! environment variables. Durations are expressed in milliseconds on disk.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::throttling::RateLimitConfig;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/margin-analysis";

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Datasets pre-loaded into the cache by `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmDataset {
    CustomerPatterns,
    VendorPerformance,
    MarginSummary,
}

impl WarmDataset {
    pub const fn cache_key(self) -> &'static str {
        match self {
            Self::CustomerPatterns => "customer_patterns",
            Self::VendorPerformance => "vendor_performance",
            Self::MarginSummary => "margin_summary",
        }
    }

    /// Endpoint the dataset is loaded from.
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::CustomerPatterns => "/customer-patterns",
            Self::VendorPerformance => "/vendor-performance",
            Self::MarginSummary => "/margin-summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Bearer token; `None` runs in demo mode without authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub enable_caching: bool,
    pub enable_batching: bool,
    pub enable_offline_support: bool,
    pub max_concurrent_requests: usize,
    #[serde(with = "duration_ms")]
    pub default_cache_ttl: Duration,
    pub cache_max_entries: usize,
    #[serde(with = "duration_ms")]
    pub cache_sweep_interval: Duration,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// How long a batchable request waits for identical calls to join it.
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub bulk_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub bulk_batch_delay: Duration,
    pub warm_up: Vec<WarmDataset>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            auth_token: None,
            enable_caching: true,
            enable_batching: true,
            enable_offline_support: false,
            max_concurrent_requests: 6,
            default_cache_ttl: Duration::from_secs(300),
            cache_max_entries: 1_000,
            cache_sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            batch_window: Duration::from_millis(10),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulk_batch_size: 5,
            bulk_batch_delay: Duration::from_millis(100),
            warm_up: vec![WarmDataset::CustomerPatterns],
        }
    }
}

impl ServiceConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `MARGIN_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `MARGIN_API_BASE_URL` | `base_url` |
    /// | `MARGIN_API_TOKEN` | `auth_token` |
    /// | `MARGIN_ENABLE_CACHING` | `enable_caching` |
    /// | `MARGIN_ENABLE_BATCHING` | `enable_batching` |
    /// | `MARGIN_ENABLE_OFFLINE` | `enable_offline_support` |
    /// | `MARGIN_MAX_CONCURRENT_REQUESTS` | `max_concurrent_requests` |
    /// | `MARGIN_DEFAULT_CACHE_TTL_MS` | `default_cache_ttl` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(base_url) = env::var("MARGIN_API_BASE_URL") {
            config.base_url = base_url;
        }
        config.auth_token = env::var("MARGIN_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        if let Some(value) = env_parse::<bool>("MARGIN_ENABLE_CACHING")? {
            config.enable_caching = value;
        }
        if let Some(value) = env_parse::<bool>("MARGIN_ENABLE_BATCHING")? {
            config.enable_batching = value;
        }
        if let Some(value) = env_parse::<bool>("MARGIN_ENABLE_OFFLINE")? {
            config.enable_offline_support = value;
        }
        if let Some(value) = env_parse::<usize>("MARGIN_MAX_CONCURRENT_REQUESTS")? {
            config.max_concurrent_requests = value;
        }
        if let Some(value) = env_parse::<u64>("MARGIN_DEFAULT_CACHE_TTL_MS")? {
            config.default_cache_ttl = Duration::from_millis(value);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl {
                value: self.base_url.clone(),
            });
        }

        let positive = [
            ("max_concurrent_requests", self.max_concurrent_requests as u64),
            ("default_cache_ttl", self.default_cache_ttl.as_millis() as u64),
            ("request_timeout", self.request_timeout.as_millis() as u64),
            ("cache_max_entries", self.cache_max_entries as u64),
            ("bulk_batch_size", self.bulk_batch_size as u64),
            ("rate_limit.max_requests", u64::from(self.rate_limit.max_requests)),
            ("rate_limit.window", self.rate_limit.window.as_millis() as u64),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
            (
                "circuit_breaker.failure_threshold",
                u64::from(self.circuit_breaker.failure_threshold),
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }

        self.retry.validate()
    }

    /// Copy safe to expose through metrics.
    pub fn redacted(&self) -> Self {
        Self {
            auth_token: self.auth_token.as_ref().map(|_| String::from("***")),
            ..self.clone()
        }
    }
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Partial update accepted by `MarginAnalysisService::update_config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    pub enable_caching: Option<bool>,
    pub enable_batching: Option<bool>,
    pub enable_offline_support: Option<bool>,
    pub max_concurrent_requests: Option<usize>,
    pub default_cache_ttl: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub bulk_batch_size: Option<usize>,
    pub bulk_batch_delay: Option<Duration>,
}

impl ConfigUpdate {
    /// Apply onto a copy of `current` and validate the result.
    pub fn apply_to(&self, current: &ServiceConfig) -> Result<ServiceConfig, ConfigError> {
        let mut next = current.clone();
        if let Some(value) = self.enable_caching {
            next.enable_caching = value;
        }
        if let Some(value) = self.enable_batching {
            next.enable_batching = value;
        }
        if let Some(value) = self.enable_offline_support {
            next.enable_offline_support = value;
        }
        if let Some(value) = self.max_concurrent_requests {
            next.max_concurrent_requests = value;
        }
        if let Some(value) = self.default_cache_ttl {
            next.default_cache_ttl = value;
        }
        if let Some(value) = self.request_timeout {
            next.request_timeout = value;
        }
        if let Some(value) = self.rate_limit {
            next.rate_limit = value;
        }
        if let Some(value) = &self.retry {
            next.retry = value.clone();
        }
        if let Some(value) = self.circuit_breaker {
            next.circuit_breaker = value;
        }
        if let Some(value) = self.bulk_batch_size {
            next.bulk_batch_size = value;
        }
        if let Some(value) = self.bulk_batch_delay {
            next.bulk_batch_delay = value;
        }
        next.validate()?;
        Ok(next)
    }
}
