//! Bucket key resolution.
//!
//! Requests to the same host share one bucket unless a configured bucket
//! claims the endpoint, either through its path `pattern` or by naming the
//! endpoint in `share_with`.

use regex::Regex;

use crate::error::{Result, ThrottlerError};
use crate::rate_limit_config::BucketConfig;
use crate::request::RequestSpec;

#[derive(Debug, Clone)]
struct BucketRule {
    key: String,
    pattern: Option<Regex>,
    share_with: Vec<String>,
}

/// Maps requests to bucket keys.
#[derive(Debug, Clone, Default)]
pub struct BucketResolver {
    rules: Vec<BucketRule>,
}

impl BucketResolver {
    /// Compiles the configured buckets. Rules are tried in order.
    pub fn new(buckets: &[BucketConfig]) -> Result<Self> {
        let rules = buckets
            .iter()
            .map(|bucket| {
                let pattern = bucket
                    .pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|source| ThrottlerError::InvalidPattern {
                        key: bucket.key.clone(),
                        source,
                    })?;
                Ok(BucketRule {
                    key: bucket.key.clone(),
                    pattern,
                    share_with: bucket.share_with.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// Bucket key for `request`: `host` or `host:bucket`.
    pub fn resolve(&self, request: &RequestSpec) -> Result<String> {
        let host = request.host()?;
        let endpoint = request.endpoint()?;
        Ok(self.resolve_endpoint(&host, &endpoint))
    }

    pub fn resolve_endpoint(&self, host: &str, endpoint: &str) -> String {
        let by_pattern = self.rules.iter().find(|rule| {
            rule.pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(endpoint))
        });

        let rule = by_pattern.or_else(|| {
            let name = endpoint_name(endpoint);
            self.rules.iter().find(|rule| {
                rule.share_with.iter().any(|shared| {
                    let shared = shared.trim_matches('/');
                    shared == name || shared == endpoint.trim_matches('/')
                })
            })
        });

        match rule {
            Some(rule) => format!("{}:{}", host, rule.key),
            None => host.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Last non-empty path segment, e.g. `markets` for `/v1/markets/`.
fn endpoint_name(endpoint: &str) -> &str {
    endpoint
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> BucketResolver {
        BucketResolver::new(&[
            BucketConfig::new("orders").with_pattern("^/v1/orders"),
            BucketConfig::new("public").sharing(&["markets", "events"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_host_key_without_buckets() {
        let resolver = BucketResolver::default();
        let request = RequestSpec::get("https://api.test.com/v1/markets");
        assert_eq!(resolver.resolve(&request).unwrap(), "api.test.com");
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_pattern_match() {
        let resolver = resolver();
        let request = RequestSpec::post("https://api.test.com/v1/orders/123");
        assert_eq!(resolver.resolve(&request).unwrap(), "api.test.com:orders");
    }

    #[test]
    fn test_share_with_groups_endpoints() {
        let resolver = resolver();
        let markets = RequestSpec::get("https://api.test.com/v1/markets");
        let events = RequestSpec::get("https://api.test.com/v2/events/");
        assert_eq!(resolver.resolve(&markets).unwrap(), "api.test.com:public");
        assert_eq!(resolver.resolve(&events).unwrap(), "api.test.com:public");
    }

    #[test]
    fn test_unmatched_falls_back_to_host() {
        let resolver = resolver();
        let request = RequestSpec::get("https://api.test.com/v1/positions");
        assert_eq!(resolver.resolve(&request).unwrap(), "api.test.com");
    }

    #[test]
    fn test_pattern_wins_over_share_with() {
        let resolver = BucketResolver::new(&[
            BucketConfig::new("shared").sharing(&["orders"]),
            BucketConfig::new("by-path").with_pattern("orders$"),
        ])
        .unwrap();
        assert_eq!(resolver.resolve_endpoint("h", "/v1/orders"), "h:by-path");
    }

    #[test]
    fn test_invalid_pattern() {
        let err = BucketResolver::new(&[BucketConfig::new("bad").with_pattern("(")]).unwrap_err();
        assert!(matches!(err, ThrottlerError::InvalidPattern { key, .. } if key == "bad"));
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(endpoint_name("/v1/markets/"), "markets");
        assert_eq!(endpoint_name("/"), "");
        assert_eq!(endpoint_name("markets"), "markets");
    }
}
