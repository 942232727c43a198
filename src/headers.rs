use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::rate_limit_config::HeaderNames;

/// Rate limit values declared by a response.
///
/// Values that are missing or fail to parse are `None`; they never cause an
/// error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Unix timestamp at which the server's window resets.
    pub reset: Option<f64>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HashMap<String, String>, names: &HeaderNames) -> Self {
        Self {
            limit: header(headers, &names.limit).and_then(|v| v.trim().parse().ok()),
            remaining: header(headers, &names.remaining).and_then(|v| v.trim().parse().ok()),
            reset: header(headers, &names.reset)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|reset| reset.is_finite()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset.is_none()
    }
}

/// Case-insensitive header lookup.
pub fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// The rate limit headers present in a response, keyed by their configured
/// names, for telemetry.
pub fn headers_seen(
    headers: &HashMap<String, String>,
    names: &HeaderNames,
) -> BTreeMap<String, String> {
    [&names.limit, &names.remaining, &names.reset, &names.retry_after]
        .into_iter()
        .filter_map(|name| header(headers, name).map(|value| (name.clone(), value.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_rate_limit_headers() {
        let parsed = RateLimitHeaders::parse(
            &headers(&[
                ("X-RateLimit-Limit", "100"),
                ("X-RateLimit-Remaining", "50"),
                ("X-RateLimit-Reset", "1060.0"),
            ]),
            &HeaderNames::default(),
        );
        assert_eq!(
            parsed,
            RateLimitHeaders {
                limit: Some(100),
                remaining: Some(50),
                reset: Some(1060.0),
            }
        );
    }

    #[test]
    fn test_missing_headers() {
        let parsed = RateLimitHeaders::parse(&HashMap::new(), &HeaderNames::default());
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_malformed_values_are_absent() {
        let parsed = RateLimitHeaders::parse(
            &headers(&[
                ("X-RateLimit-Limit", "lots"),
                ("X-RateLimit-Remaining", "-1"),
                ("X-RateLimit-Reset", "NaN"),
            ]),
            &HeaderNames::default(),
        );
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let parsed = RateLimitHeaders::parse(
            &headers(&[("x-ratelimit-remaining", "7")]),
            &HeaderNames::default(),
        );
        assert_eq!(parsed.remaining, Some(7));
    }

    #[test]
    fn test_custom_header_names() {
        let names = HeaderNames {
            remaining: "X-Quota-Left".to_string(),
            ..HeaderNames::default()
        };
        let parsed = RateLimitHeaders::parse(&headers(&[("X-Quota-Left", "3")]), &names);
        assert_eq!(parsed.remaining, Some(3));
    }

    #[test]
    fn test_headers_seen_keeps_only_rate_limit_headers() {
        let seen = headers_seen(
            &headers(&[
                ("Retry-After", "10"),
                ("Content-Type", "application/json"),
                ("x-ratelimit-limit", "100"),
            ]),
            &HeaderNames::default(),
        );
        assert_eq!(seen.len(), 2);
        assert_eq!(seen["Retry-After"], "10");
        assert_eq!(seen["X-RateLimit-Limit"], "100");
    }
}
