use thiserror::Error;

/// Errors raised by the throttler.
///
/// Malformed rate-limit headers and exhausted retry budgets are not errors:
/// the former are treated as absent, the latter come back as a
/// [`ResponseDecision`](crate::response::ResponseDecision).
#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid pattern for bucket '{key}': {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid request URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Request URL has no host: {0}")]
    MissingHost(String),

    #[error("Concurrency gate is closed")]
    GateClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThrottlerError {
    pub(crate) fn poisoned(what: &str) -> Self {
        ThrottlerError::Internal(format!("Failed to acquire lock on {}", what))
    }
}

impl From<serde_yaml::Error> for ThrottlerError {
    fn from(err: serde_yaml::Error) -> Self {
        ThrottlerError::Config(format!("Invalid YAML in limits file: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ThrottlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ThrottlerError::ValidationError("burst must be at least 1".to_string());
        assert_eq!(err.to_string(), "Validation error: burst must be at least 1");

        let err = ThrottlerError::poisoned("buckets");
        assert_eq!(err.to_string(), "Internal error: Failed to acquire lock on buckets");
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<u32>("[not, a, number").unwrap_err();
        let err: ThrottlerError = yaml_err.into();
        assert!(matches!(err, ThrottlerError::Config(_)));
    }
}
