use serde::Serialize;
use std::time::Duration;

/// Relative difference between the current rate and the rate derived from
/// server headers that triggers an adaptive adjustment.
pub const ADAPTIVE_THRESHOLD: f64 = 0.10;

/// Longest server reset window honoured, in seconds. Resets declared further
/// out are treated as falling at `now + MAX_RESET_WINDOW`.
pub const MAX_RESET_WINDOW: f64 = 86_400.0;

/// Token bucket for a single bucket key.
///
/// Time is passed in explicitly (Unix seconds) so that callers decide which
/// clock drives the bucket. The bucket itself is not synchronised; the
/// limiter keeps each one behind its own lock.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBucket {
    capacity: u32,
    base_rate: f64,
    rate: f64, // tokens per second
    tokens: f64,
    last_refill: f64,
    server_limit: Option<u64>,
    server_remaining: Option<u64>,
    server_reset: Option<f64>,
}

/// A rate replacement made by the adaptive rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateChange {
    pub previous: f64,
    pub current: f64,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: u32, rate: f64, now: f64) -> Self {
        Self::with_tokens(capacity, rate, capacity as f64, now)
    }

    /// Creates a bucket holding `tokens`, clamped to `[0, capacity]`.
    pub fn with_tokens(capacity: u32, rate: f64, tokens: f64, now: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            base_rate: rate,
            rate,
            tokens: tokens.clamp(0.0, capacity as f64),
            last_refill: now,
            server_limit: None,
            server_remaining: None,
            server_reset: None,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn server_limit(&self) -> Option<u64> {
        self.server_limit
    }

    pub fn server_remaining(&self) -> Option<u64> {
        self.server_remaining
    }

    pub fn server_reset(&self) -> Option<f64> {
        self.server_reset
    }

    /// Adds the tokens earned since the last refill.
    ///
    /// Timestamps at or before the last refill add nothing and do not move
    /// the refill marker backwards.
    pub fn refill(&mut self, now: f64) {
        self.expire_server_window(now);

        let elapsed = now - self.last_refill;
        if elapsed <= 0.0 {
            return;
        }

        let new_tokens = elapsed * self.effective_rate(now);
        self.tokens = (self.tokens + new_tokens).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Refills, then takes `count` tokens if they are all available.
    pub fn consume(&mut self, count: u32, now: f64) -> bool {
        self.refill(now);

        if self.tokens >= count as f64 {
            self.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    /// Refills, then reports the current token level.
    pub fn peek(&mut self, now: f64) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Time until `count` tokens are available at the current rate.
    pub fn time_until(&mut self, count: u32, now: f64) -> Duration {
        self.refill(now);

        if self.tokens >= count as f64 {
            return Duration::ZERO;
        }

        let seconds = (count as f64 - self.tokens) / self.rate;
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// True while the server has declared zero remaining quota and its reset
    /// instant is still in the future.
    pub fn in_exhaustion_window(&self, now: f64) -> bool {
        matches!(
            (self.server_remaining, self.server_reset),
            (Some(0), Some(reset)) if reset > now
        )
    }

    /// Seconds until the server-declared reset, if one is pending.
    pub fn until_reset(&self, now: f64) -> Option<f64> {
        self.server_reset
            .map(|reset| reset - now)
            .filter(|remaining| *remaining > 0.0)
    }

    /// Records server-declared limits and applies the adaptive rule.
    ///
    /// When `limit`, `remaining` and a future `reset` are all present, the
    /// rate is replaced by `remaining / (reset - now)` if that differs from
    /// the current rate by more than [`ADAPTIVE_THRESHOLD`].
    pub fn update_from_headers(
        &mut self,
        limit: Option<u64>,
        remaining: Option<u64>,
        reset: Option<f64>,
        now: f64,
    ) -> Option<RateChange> {
        self.refill(now);
        let reset = reset.map(|reset| reset.min(now + MAX_RESET_WINDOW));

        if limit.is_some() {
            self.server_limit = limit;
        }
        if let Some(remaining) = remaining {
            self.server_remaining = Some(remaining);
            // The server knows of fewer requests left than we do.
            if (remaining as f64) < self.tokens {
                self.tokens = remaining as f64;
            }
        }
        if reset.is_some() {
            self.server_reset = reset;
        }

        let (Some(_), Some(remaining), Some(reset)) = (limit, remaining, reset) else {
            return None;
        };
        let window = reset - now;
        if window <= 0.0 || remaining == 0 {
            return None;
        }

        let candidate = remaining as f64 / window;
        if ((candidate - self.rate) / self.rate).abs() <= ADAPTIVE_THRESHOLD {
            return None;
        }

        let change = RateChange {
            previous: self.rate,
            current: candidate,
        };
        self.rate = candidate;
        Some(change)
    }

    fn effective_rate(&self, now: f64) -> f64 {
        match (self.server_remaining, self.server_reset) {
            (Some(remaining), Some(reset)) if reset > now && remaining > 0 => {
                self.rate.min(remaining as f64 / (reset - now))
            }
            _ => self.rate,
        }
    }

    fn expire_server_window(&mut self, now: f64) {
        if matches!(self.server_reset, Some(reset) if reset <= now) {
            self.server_limit = None;
            self.server_remaining = None;
            self.server_reset = None;
            self.rate = self.base_rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1000.0;

    #[test]
    fn test_token_bucket_creation() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        assert_eq!(bucket.capacity(), 20);
        assert_eq!(bucket.rate(), 10.0);
        assert_eq!(bucket.peek(T0), 20.0);
    }

    #[test]
    fn test_custom_initial_tokens_are_clamped() {
        let mut bucket = TokenBucket::with_tokens(20, 10.0, 5.0, T0);
        assert_eq!(bucket.peek(T0), 5.0);

        let mut bucket = TokenBucket::with_tokens(20, 10.0, 50.0, T0);
        assert_eq!(bucket.peek(T0), 20.0);

        let mut bucket = TokenBucket::with_tokens(20, 10.0, -3.0, T0);
        assert_eq!(bucket.peek(T0), 0.0);
    }

    #[test]
    fn test_token_consumption() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        assert!(bucket.consume(5, T0));
        assert_eq!(bucket.peek(T0), 15.0);
    }

    #[test]
    fn test_failed_consume_leaves_tokens_unchanged() {
        let mut bucket = TokenBucket::with_tokens(20, 10.0, 3.0, T0);
        assert!(!bucket.consume(5, T0));
        assert_eq!(bucket.peek(T0), 3.0);
    }

    #[test]
    fn test_refill_partial_and_capped() {
        let mut bucket = TokenBucket::with_tokens(20, 10.0, 10.0, T0);
        assert_eq!(bucket.peek(T0 + 0.5), 15.0);
        assert_eq!(bucket.peek(T0 + 10.0), 20.0);
    }

    #[test]
    fn test_refill_ignores_time_going_backwards() {
        let mut bucket = TokenBucket::with_tokens(20, 10.0, 5.0, T0);
        bucket.refill(T0 - 100.0);
        assert_eq!(bucket.peek(T0 - 100.0), 5.0);
        // The refill marker did not move back, so no phantom tokens appear.
        assert_eq!(bucket.peek(T0), 5.0);
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let mut bucket = TokenBucket::new(5, 3.0, T0);
        let mut now = T0;
        for step in 0..200 {
            now += (step % 7) as f64 * 0.05;
            let _ = bucket.consume(1 + (step % 3) as u32, now);
            let level = bucket.peek(now);
            assert!((0.0..=5.0).contains(&level), "level {} out of range", level);
        }
    }

    #[test]
    fn test_burst_then_wait() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        for _ in 0..20 {
            assert!(bucket.consume(1, T0));
        }
        assert!(!bucket.consume(1, T0));

        let wait = bucket.time_until(1, T0);
        assert!((wait.as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_time_until_tokens() {
        let mut bucket = TokenBucket::with_tokens(20, 10.0, 5.0, T0);
        assert!((bucket.time_until(10, T0).as_secs_f64() - 0.5).abs() < 1e-9);
        assert_eq!(bucket.time_until(5, T0), Duration::ZERO);
    }

    #[test]
    fn test_adaptive_rate_uses_remaining_over_window() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        let change = bucket.update_from_headers(Some(500), Some(400), Some(T0 + 20.0), T0);

        let change = change.expect("rate should change");
        assert_eq!(change.previous, 10.0);
        assert!((change.current - 20.0).abs() < 1e-9);
        assert!((bucket.rate() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_rate_within_threshold_is_ignored() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        // 210 / 20 = 10.5, only 5% away from 10.
        let change = bucket.update_from_headers(Some(500), Some(210), Some(T0 + 20.0), T0);
        assert!(change.is_none());
        assert_eq!(bucket.rate(), 10.0);
    }

    #[test]
    fn test_adaptive_rule_needs_all_three_headers() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        assert!(bucket
            .update_from_headers(None, Some(400), Some(T0 + 20.0), T0)
            .is_none());
        assert!(bucket
            .update_from_headers(Some(500), Some(400), Some(T0 - 1.0), T0)
            .is_none());
        assert_eq!(bucket.rate(), 10.0);
    }

    #[test]
    fn test_remaining_lowers_local_tokens() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        bucket.update_from_headers(None, Some(3), None, T0);
        assert_eq!(bucket.peek(T0), 3.0);
        assert_eq!(bucket.server_remaining(), Some(3));
    }

    #[test]
    fn test_exhaustion_window() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        bucket.update_from_headers(Some(100), Some(0), Some(T0 + 30.0), T0);

        assert!(bucket.in_exhaustion_window(T0));
        assert_eq!(bucket.until_reset(T0), Some(30.0));
        assert_eq!(bucket.peek(T0), 0.0);
        assert!(!bucket.in_exhaustion_window(T0 + 30.0));
    }

    #[test]
    fn test_server_window_expires_and_base_rate_returns() {
        let mut bucket = TokenBucket::new(20, 10.0, T0);
        bucket.update_from_headers(Some(500), Some(400), Some(T0 + 20.0), T0);
        assert!((bucket.rate() - 20.0).abs() < 1e-9);

        bucket.refill(T0 + 25.0);
        assert_eq!(bucket.rate(), 10.0);
        assert_eq!(bucket.server_reset(), None);
        assert_eq!(bucket.server_limit(), None);
    }

    #[test]
    fn test_far_future_reset_is_capped() {
        let mut bucket = TokenBucket::new(1, 10.0, T0);
        bucket.update_from_headers(Some(10), Some(0), Some(1e300), T0);
        assert_eq!(bucket.server_reset(), Some(T0 + MAX_RESET_WINDOW));
        assert_eq!(bucket.until_reset(T0), Some(MAX_RESET_WINDOW));

        let mut bucket = TokenBucket::new(1, 10.0, T0);
        let change = bucket.update_from_headers(Some(10), Some(1), Some(1e300), T0);
        assert_eq!(change.map(|c| c.current), Some(1.0 / MAX_RESET_WINDOW));
        assert!(bucket.consume(1, T0));
        assert!((bucket.time_until(1, T0).as_secs_f64() - MAX_RESET_WINDOW).abs() < 1e-6);
    }

    #[test]
    fn test_server_window_slows_refill() {
        let mut bucket = TokenBucket::with_tokens(100, 10.0, 0.0, T0);
        // 2 requests left before the reset, far below 10/s.
        bucket.update_from_headers(None, Some(2), Some(T0 + 10.0), T0);
        let level = bucket.peek(T0 + 1.0);
        assert!((level - 2.0 / 9.0).abs() < 1e-9);
    }
}
