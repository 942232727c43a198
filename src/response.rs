use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// What the caller observed after sending a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub elapsed: Duration,
    /// Retries already made for this request, as counted by the caller.
    pub attempt: u32,
}

impl ObservedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// The limiter's verdict on a response.
///
/// `wait` is how long the caller should sleep before its next request to
/// this bucket. `should_retry` says whether the same request may be sent
/// again; a terminal failure has `should_retry == false` and a non-success
/// status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseDecision {
    pub should_retry: bool,
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
    /// The server reported its quota as exhausted.
    pub throttled: bool,
    pub reason: String,
}

impl ResponseDecision {
    /// No wait, no retry.
    pub fn proceed() -> Self {
        Self {
            should_retry: false,
            wait: Duration::ZERO,
            throttled: false,
            reason: String::new(),
        }
    }

    /// Success, but the server's quota is spent until its reset.
    pub fn wait_for_reset(wait: Duration) -> Self {
        Self {
            should_retry: false,
            wait,
            throttled: true,
            reason: "rate limit exhausted until reset".to_string(),
        }
    }

    pub fn retry_after(wait: Duration, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            wait,
            throttled: false,
            reason: reason.into(),
        }
    }

    pub fn give_up(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            wait: Duration::ZERO,
            throttled: false,
            reason: reason.into(),
        }
    }

    /// Marks the decision throttled by a pending server reset, stretching a
    /// retry wait to cover it. Terminal decisions keep a zero wait.
    pub(crate) fn with_reset_wait(mut self, reset_wait: Option<Duration>) -> Self {
        if let Some(reset_wait) = reset_wait {
            self.throttled = true;
            if self.should_retry {
                self.wait = self.wait.max(reset_wait);
            }
        }
        self
    }

    pub fn wait_secs(&self) -> f64 {
        self.wait.as_secs_f64()
    }
}
