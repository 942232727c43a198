use regex::Regex;

use crate::error::ThrottlerError;
use crate::rate_limit_config::{BucketConfig, ExchangeConfig, HeaderNames, RetryPolicy};

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a whole exchange section
    pub fn validate_exchange(config: &ExchangeConfig) -> Result<(), ThrottlerError> {
        Self::validate_host(&config.host)?;
        Self::validate_rate_limit(config.steady_rate, config.burst)?;

        if config.max_concurrency == 0 {
            return Err(ThrottlerError::ValidationError(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        Self::validate_header_names(&config.headers)?;
        Self::validate_retry_policy(&config.retry)?;

        for bucket in &config.buckets {
            Self::validate_bucket(bucket)?;
        }

        Ok(())
    }

    /// Validates the exchange host
    pub fn validate_host(host: &str) -> Result<(), ThrottlerError> {
        if host.trim().is_empty() {
            return Err(ThrottlerError::ValidationError(
                "host cannot be empty".to_string(),
            ));
        }

        if host.contains("://") || host.contains('/') {
            return Err(ThrottlerError::ValidationError(format!(
                "host '{}' must be a bare host name, not a URL",
                host
            )));
        }

        Ok(())
    }

    /// Validates rate limit parameters
    pub fn validate_rate_limit(steady_rate: f64, burst: u32) -> Result<(), ThrottlerError> {
        if !steady_rate.is_finite() || steady_rate <= 0.0 {
            return Err(ThrottlerError::ValidationError(
                "steady_rate must be a positive number".to_string(),
            ));
        }

        if burst == 0 {
            return Err(ThrottlerError::ValidationError(
                "burst must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates header name overrides
    pub fn validate_header_names(headers: &HeaderNames) -> Result<(), ThrottlerError> {
        let names = [
            ("limit", &headers.limit),
            ("remaining", &headers.remaining),
            ("reset", &headers.reset),
            ("retry_after", &headers.retry_after),
        ];

        for (field, name) in names {
            if name.trim().is_empty() {
                return Err(ThrottlerError::ValidationError(format!(
                    "header name for '{}' cannot be empty",
                    field
                )));
            }
        }

        Ok(())
    }

    /// Validates backoff settings
    pub fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), ThrottlerError> {
        if policy.base_backoff.is_zero() {
            return Err(ThrottlerError::ValidationError(
                "base_backoff must be greater than 0".to_string(),
            ));
        }

        if policy.base_backoff > policy.max_backoff {
            return Err(ThrottlerError::ValidationError(
                "base_backoff cannot exceed max_backoff".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&policy.jitter) {
            return Err(ThrottlerError::ValidationError(format!(
                "jitter must be in [0, 1), got {}",
                policy.jitter
            )));
        }

        Ok(())
    }

    /// Validates a named bucket
    pub fn validate_bucket(bucket: &BucketConfig) -> Result<(), ThrottlerError> {
        if bucket.key.trim().is_empty() {
            return Err(ThrottlerError::ValidationError(
                "bucket key cannot be empty".to_string(),
            ));
        }

        if let Some(pattern) = &bucket.pattern {
            Regex::new(pattern).map_err(|source| ThrottlerError::InvalidPattern {
                key: bucket.key.clone(),
                source,
            })?;
        }

        Ok(())
    }
}
