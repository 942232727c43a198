use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

use crate::error::{Result, ThrottlerError};

/// Methods that may be retried after a server error.
pub const IDEMPOTENT_METHODS: [&str; 5] = ["GET", "HEAD", "PUT", "DELETE", "OPTIONS"];

/// An outgoing request as seen by the limiter.
///
/// Only the URL (bucket resolution) and method (5xx retry eligibility) are
/// inspected; everything else is carried opaquely for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn parsed_url(&self) -> Result<Url> {
        Url::parse(&self.url).map_err(|source| ThrottlerError::InvalidUrl {
            url: self.url.clone(),
            source,
        })
    }

    /// Host plus an explicit port when one is given, e.g. `api.test.com:8443`.
    pub fn host(&self) -> Result<String> {
        let url = self.parsed_url()?;
        let host = url
            .host_str()
            .ok_or_else(|| ThrottlerError::MissingHost(self.url.clone()))?;
        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// URL path, e.g. `/v1/markets`.
    pub fn endpoint(&self) -> Result<String> {
        Ok(self.parsed_url()?.path().to_string())
    }

    pub fn is_idempotent(&self) -> bool {
        is_idempotent(&self.method)
    }
}

pub fn is_idempotent(method: &str) -> bool {
    IDEMPOTENT_METHODS
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_and_endpoint() {
        let request = RequestSpec::get("https://api.test.com/v1/markets?limit=5");
        assert_eq!(request.host().unwrap(), "api.test.com");
        assert_eq!(request.endpoint().unwrap(), "/v1/markets");

        let request = RequestSpec::get("http://localhost:8080/orders");
        assert_eq!(request.host().unwrap(), "localhost:8080");
    }

    #[test]
    fn test_invalid_urls() {
        assert!(matches!(
            RequestSpec::get("not a url").host(),
            Err(ThrottlerError::InvalidUrl { .. })
        ));
        assert!(matches!(
            RequestSpec::get("data:text/plain,hello").host(),
            Err(ThrottlerError::MissingHost(_))
        ));
    }

    #[test]
    fn test_idempotent_methods() {
        for method in ["GET", "head", "PUT", "DELETE", "OPTIONS"] {
            assert!(is_idempotent(method), "{} should be idempotent", method);
        }
        for method in ["POST", "PATCH", "CONNECT"] {
            assert!(!is_idempotent(method), "{} should not be idempotent", method);
        }
        assert!(!RequestSpec::post("https://a.com/x").is_idempotent());
    }

    #[test]
    fn test_builder_keeps_opaque_fields() {
        let request = RequestSpec::post("https://api.test.com/orders")
            .with_header("Authorization", "Bearer t")
            .with_query("page", "2")
            .with_body(serde_json::json!({"side": "buy"}));
        assert_eq!(request.headers["Authorization"], "Bearer t");
        assert_eq!(request.query_params["page"], "2");
        assert_eq!(request.body.unwrap()["side"], "buy");
    }
}
