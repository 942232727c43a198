//! Exponential backoff and `Retry-After` parsing.

use chrono::{DateTime, NaiveDateTime};
use rand::Rng;
use std::time::Duration;

use crate::rate_limit_config::RetryPolicy;

/// Bounded exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    /// `jitter` is the half-width of the scaling band: 0.25 scales by a
    /// uniform factor in `[0.75, 1.25]`.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// `base * 2^attempt`, capped at `max`, optionally jittered.
    pub fn compute(&self, attempt: u32, jitter: bool) -> Duration {
        let exponent = attempt.min(63) as i32;
        let seconds = (self.base.as_secs_f64() * 2f64.powi(exponent)).min(self.max.as_secs_f64());

        let seconds = if jitter && self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            seconds * factor
        } else {
            seconds
        };

        Duration::try_from_secs_f64(seconds).unwrap_or(self.max)
    }
}

impl From<&RetryPolicy> for BackoffPolicy {
    fn from(policy: &RetryPolicy) -> Self {
        Self::new(policy.base_backoff, policy.max_backoff, policy.jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

/// Parses a `Retry-After` value given the current Unix time.
///
/// Accepts delay-seconds (integer or fractional) or an HTTP-date. Dates in
/// the past yield zero. Anything else yields `None` so the caller can fall
/// back to exponential backoff.
pub fn parse_retry_after(value: &str, now: f64) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<f64>() {
        return if seconds.is_finite() && seconds >= 0.0 {
            Duration::try_from_secs_f64(seconds).ok()
        } else {
            None
        };
    }

    let instant = parse_http_date(value)?;
    Some(Duration::try_from_secs_f64((instant - now).max(0.0)).unwrap_or(Duration::ZERO))
}

/// IMF-fixdate, RFC 850 and asctime forms, as Unix seconds.
fn parse_http_date(value: &str) -> Option<f64> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.timestamp_millis() as f64 / 1000.0);
    }

    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc().timestamp_millis() as f64 / 1000.0)
}
