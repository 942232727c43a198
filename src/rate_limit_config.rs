use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::config_validator::ConfigValidator;
use crate::error::{Result, ThrottlerError};

/// All configured exchanges, as read from a limits file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
}

/// Rate limit settings for a single exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub host: String,
    #[serde(default = "default_steady_rate")]
    pub steady_rate: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub headers: HeaderNames,
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Names of the response headers carrying rate limit information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
    pub retry_after: String,
}

/// A named bucket shared by every endpoint it matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub key: String,
    /// Regex matched against the endpoint path.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Endpoint names that draw from this bucket.
    #[serde(default)]
    pub share_with: Vec<String>,
}

/// Backoff and retry bounds for 429 and 5xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Half-width of the jitter band as a fraction of the delay.
    pub jitter: f64,
    /// `None` leaves 429 retries unbounded; the caller's loop decides.
    pub max_retries_429: Option<u32>,
    pub max_retries_5xx: u32,
}

fn default_steady_rate() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    20
}

fn default_max_concurrency() -> u32 {
    4
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            host: "api.example.com".to_string(),
            steady_rate: default_steady_rate(),
            burst: default_burst(),
            max_concurrency: default_max_concurrency(),
            headers: HeaderNames::default(),
            buckets: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            limit: "X-RateLimit-Limit".to_string(),
            remaining: "X-RateLimit-Remaining".to_string(),
            reset: "X-RateLimit-Reset".to_string(),
            retry_after: "Retry-After".to_string(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.25,
            max_retries_429: Some(5),
            max_retries_5xx: 3,
        }
    }
}

impl ExchangeConfig {
    pub fn new(host: impl Into<String>, steady_rate: f64, burst: u32, max_concurrency: u32) -> Self {
        Self {
            host: host.into(),
            steady_rate,
            burst,
            max_concurrency,
            ..Self::default()
        }
    }

    pub fn with_buckets(mut self, buckets: Vec<BucketConfig>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_exchange(self)
    }
}

impl BucketConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: None,
            share_with: Vec::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn sharing(mut self, endpoints: &[&str]) -> Self {
        self.share_with = endpoints.iter().map(|e| e.to_string()).collect();
        self
    }
}

impl LimitsConfig {
    /// Parses and validates a limits document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: LimitsConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a limits file from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ThrottlerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Like [`LimitsConfig::load`], but a missing file yields the built-in
    /// default. A file that exists and is invalid is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Limits file not found, using defaults");
            return Ok(Self::default_limits());
        }
        Self::load(path)
    }

    /// A single `default` exchange with stock settings.
    pub fn default_limits() -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert("default".to_string(), ExchangeConfig::default());
        Self { exchanges }
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchanges.is_empty() {
            return Err(ThrottlerError::ValidationError(
                "Limits file must define at least one exchange".to_string(),
            ));
        }
        for (name, exchange) in &self.exchanges {
            exchange.validate().map_err(|e| match e {
                ThrottlerError::ValidationError(msg) => {
                    ThrottlerError::ValidationError(format!("exchange '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    pub fn get_exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.get(name)
    }

    pub fn get_exchange_or_default(&self, name: &str) -> ExchangeConfig {
        self.exchanges.get(name).cloned().unwrap_or_default()
    }

    /// Sorted exchange names.
    pub fn exchange_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.exchanges.keys().collect();
        names.sort();
        names
    }
}
