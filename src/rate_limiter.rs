//! Header-aware rate limiter for one exchange.
//!
//! A request goes through [`RateLimiter::acquire`] (or
//! [`RateLimiter::acquire_blocking`] from plain threads), which holds a
//! concurrency slot and a bucket token for it. After the call, the caller
//! reports the outcome through [`RateLimiter::handle_response`] and sleeps
//! or retries as the returned [`ResponseDecision`] says.
//!
//! Both acquire flavours share [`RateLimiter::poll_token`]; only the way they
//! suspend differs. Waiters are not served in FIFO order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::{parse_retry_after, BackoffPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, ThrottlerError};
use crate::gate::{ConcurrencyGate, GatePermit};
use crate::headers::{header, headers_seen, RateLimitHeaders};
use crate::key_generator::BucketResolver;
use crate::metrics::{RateLimiterStats, StatsCollector};
use crate::rate_limit_config::ExchangeConfig;
use crate::request::{is_idempotent, RequestSpec};
use crate::response::{ObservedResponse, ResponseDecision};
use crate::telemetry::{Decision, TelemetryEvent, TelemetrySink, TracingSink};
use crate::token_bucket::TokenBucket;

/// Shortest wait the token loop will sleep for, so that rounding never
/// produces a zero-length sleep that makes no progress.
const MIN_TOKEN_WAIT: Duration = Duration::from_micros(1);

/// Per-request retry counters, keyed by the caller's request id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub retries_429: u32,
    pub retries_5xx: u32,
}

#[derive(Debug, Clone, Copy)]
enum RetryClass {
    RateLimited,
    ServerError,
}

/// Outcome of one refill-and-consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenPoll {
    Ready { tokens_left: f64 },
    Wait(Duration),
}

#[derive(Debug, Clone)]
struct Target {
    bucket_key: String,
    endpoint: String,
}

/// Proof that a request holds a concurrency slot and a token.
///
/// Dropping the guard returns the slot.
#[derive(Debug)]
pub struct RateLimitGuard {
    _permit: GatePermit,
    wait: Duration,
    bucket_key: String,
}

impl RateLimitGuard {
    /// Time spent waiting for a token.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn wait_secs(&self) -> f64 {
        self.wait.as_secs_f64()
    }

    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }
}

pub struct RateLimiter {
    config: ExchangeConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    resolver: BucketResolver,
    backoff: BackoffPolicy,
    gate: ConcurrencyGate,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    stats: StatsCollector,
    retry_state: Mutex<HashMap<String, RetryState>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("host", &self.config.host)
            .field("max_concurrency", &self.gate.max_concurrency())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// A limiter on the system clock that logs telemetry through `tracing`.
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(TracingSink::default()))
    }

    pub fn with_parts(
        config: ExchangeConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = BucketResolver::new(&config.buckets)?;
        let backoff = BackoffPolicy::from(&config.retry);
        let gate = ConcurrencyGate::new(config.max_concurrency as usize);

        debug!(
            host = %config.host,
            steady_rate = config.steady_rate,
            burst = config.burst,
            max_concurrency = config.max_concurrency,
            "Rate limiter created"
        );

        Ok(Self {
            config,
            clock,
            sink,
            resolver,
            backoff,
            gate,
            buckets: RwLock::new(HashMap::new()),
            stats: StatsCollector::new(),
            retry_state: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Waits, without blocking the worker thread, for a concurrency slot and
    /// a token.
    pub async fn acquire(&self, request: &RequestSpec) -> Result<RateLimitGuard> {
        let target = self.target(request)?;
        let permit = self.gate.enter().await?;
        let bucket = self.bucket(&target.bucket_key)?;

        let mut waited = Duration::ZERO;
        let tokens_left = loop {
            match self.poll_token(&bucket)? {
                TokenPoll::Ready { tokens_left } => break tokens_left,
                TokenPoll::Wait(delay) => {
                    self.clock.sleep(delay).await;
                    waited = waited.saturating_add(delay);
                }
            }
        };

        self.grant(target, permit, waited, tokens_left)
    }

    /// Blocking counterpart of [`RateLimiter::acquire`] for OS threads.
    pub fn acquire_blocking(&self, request: &RequestSpec) -> Result<RateLimitGuard> {
        let target = self.target(request)?;
        let permit = self.gate.enter_blocking()?;
        let bucket = self.bucket(&target.bucket_key)?;

        let mut waited = Duration::ZERO;
        let tokens_left = loop {
            match self.poll_token(&bucket)? {
                TokenPoll::Ready { tokens_left } => break tokens_left,
                TokenPoll::Wait(delay) => {
                    self.clock.sleep_blocking(delay);
                    waited = waited.saturating_add(delay);
                }
            }
        };

        self.grant(target, permit, waited, tokens_left)
    }

    /// Returns the concurrency slot held by `guard`.
    pub fn release(&self, guard: RateLimitGuard) {
        drop(guard);
    }

    /// Refills the bucket and tries to take one token.
    ///
    /// While the server's declared quota is spent, no token is handed out and
    /// the wait runs to the server's reset. Otherwise the wait is the refill
    /// time for one token.
    pub fn poll_token(&self, bucket: &Mutex<TokenBucket>) -> Result<TokenPoll> {
        let now = self.clock.now();
        let mut bucket = bucket
            .lock()
            .map_err(|_| ThrottlerError::poisoned("bucket"))?;

        if bucket.in_exhaustion_window(now) {
            let delay = bucket.until_reset(now).map(secs).unwrap_or_default();
            return Ok(TokenPoll::Wait(delay.max(MIN_TOKEN_WAIT)));
        }

        if bucket.consume(1, now) {
            return Ok(TokenPoll::Ready {
                tokens_left: bucket.peek(now),
            });
        }

        Ok(TokenPoll::Wait(bucket.time_until(1, now).max(MIN_TOKEN_WAIT)))
    }

    /// Updates bucket state from the response and decides what the caller
    /// should do next.
    ///
    /// With a `request_id`, retry counts are tracked here and cleared on
    /// success or terminal failure; without one, `response.attempt` is used.
    pub fn handle_response(
        &self,
        request: &RequestSpec,
        response: &ObservedResponse,
        request_id: Option<&str>,
    ) -> Result<ResponseDecision> {
        let target = self.target(request)?;
        let bucket = self.bucket(&target.bucket_key)?;
        let now = self.clock.now();
        let names = &self.config.headers;
        let declared = RateLimitHeaders::parse(&response.headers, names);
        let seen = headers_seen(&response.headers, names);

        let (change, reset_wait, tokens) = {
            let mut bucket = bucket
                .lock()
                .map_err(|_| ThrottlerError::poisoned("bucket"))?;
            let change = if declared.is_empty() {
                None
            } else {
                bucket.update_from_headers(declared.limit, declared.remaining, declared.reset, now)
            };
            let reset_wait = match declared.remaining {
                Some(0) => bucket.until_reset(now).map(secs),
                _ => None,
            };
            (change, reset_wait, bucket.peek(now))
        };

        let event = |decision: Decision, sleep: Duration| {
            TelemetryEvent::new(now, &self.config.host, &target.endpoint, decision)
                .with_status(response.status)
                .with_elapsed_ms(response.elapsed.as_secs_f64() * 1000.0)
                .with_sleep(sleep.as_secs_f64())
                .with_headers(seen.clone())
                .with_bucket(&target.bucket_key, tokens)
                .with_attempt(response.attempt)
        };

        if !declared.is_empty() {
            if let Some(change) = change {
                self.stats.record_adaptive_adjustment()?;
                info!(
                    bucket = %target.bucket_key,
                    previous_rate = change.previous,
                    new_rate = change.current,
                    "Adapted bucket rate to server limits"
                );
            }
            self.sink.record(event(Decision::Adaptive, Duration::ZERO));
        }

        if let Some(wait) = reset_wait {
            self.stats.record_throttle()?;
            debug!(
                bucket = %target.bucket_key,
                wait_s = wait.as_secs_f64(),
                "Server quota exhausted until reset"
            );
        }

        let status = response.status;
        let decision = if status == 429 {
            self.stats.record_429()?;
            let attempt = self.next_attempt(request_id, RetryClass::RateLimited, response.attempt)?;

            let decision = if self.should_retry(status, attempt, &request.method) {
                let wait = header(&response.headers, &names.retry_after)
                    .and_then(|value| parse_retry_after(value, now))
                    .unwrap_or_else(|| self.backoff.compute(attempt, true));
                ResponseDecision::retry_after(wait, format!("429 retry #{}", attempt + 1))
            } else {
                self.clear_retry_state(request_id)?;
                warn!(bucket = %target.bucket_key, attempt, "Giving up after repeated 429 responses");
                ResponseDecision::give_up("Max 429 retries exceeded")
            }
            .with_reset_wait(reset_wait);

            self.sink.record(event(Decision::Backoff429, decision.wait));
            decision
        } else if (500..600).contains(&status) {
            self.stats.record_5xx()?;
            let attempt = self.next_attempt(request_id, RetryClass::ServerError, response.attempt)?;

            let decision = if self.should_retry(status, attempt, &request.method) {
                let wait = self.backoff.compute(attempt, true);
                ResponseDecision::retry_after(wait, format!("5xx retry #{}", attempt + 1))
            } else {
                self.clear_retry_state(request_id)?;
                let reason = if is_idempotent(&request.method) {
                    "Max 5xx retries exceeded".to_string()
                } else {
                    format!("{} is not idempotent, not retrying {}", request.method, status)
                };
                warn!(bucket = %target.bucket_key, status, attempt, "{}", reason);
                ResponseDecision::give_up(reason)
            }
            .with_reset_wait(reset_wait);

            self.sink.record(event(Decision::Backoff5xx, decision.wait));
            decision
        } else {
            self.clear_retry_state(request_id)?;
            match reset_wait {
                Some(wait) => ResponseDecision::wait_for_reset(wait),
                None => ResponseDecision::proceed(),
            }
        };

        Ok(decision)
    }

    /// Whether a response with `status` may be retried after `attempt`
    /// previous retries. Has no side effects.
    pub fn should_retry(&self, status: u16, attempt: u32, method: &str) -> bool {
        match status {
            429 => self
                .config
                .retry
                .max_retries_429
                .map_or(true, |max| attempt < max),
            500..=599 => is_idempotent(method) && attempt < self.config.retry.max_retries_5xx,
            _ => false,
        }
    }

    pub fn get_stats(&self) -> Result<RateLimiterStats> {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) -> Result<()> {
        self.stats.reset()
    }

    /// Bucket key a request would draw from.
    pub fn bucket_key(&self, request: &RequestSpec) -> Result<String> {
        Ok(self.target(request)?.bucket_key)
    }

    /// Keys of the buckets created so far, sorted.
    pub fn bucket_keys(&self) -> Result<Vec<String>> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| ThrottlerError::poisoned("buckets"))?;
        let mut keys: Vec<String> = buckets.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Current token level of a bucket, after refill.
    pub fn tokens_available(&self, bucket_key: &str) -> Result<Option<f64>> {
        self.with_existing_bucket(bucket_key, |bucket, now| bucket.peek(now))
    }

    /// Current refill rate of a bucket.
    pub fn bucket_rate(&self, bucket_key: &str) -> Result<Option<f64>> {
        self.with_existing_bucket(bucket_key, |bucket, now| {
            bucket.refill(now);
            bucket.rate()
        })
    }

    pub fn retry_state(&self, request_id: &str) -> Result<Option<RetryState>> {
        let states = self
            .retry_state
            .lock()
            .map_err(|_| ThrottlerError::poisoned("retry state"))?;
        Ok(states.get(request_id).copied())
    }

    fn target(&self, request: &RequestSpec) -> Result<Target> {
        let host = request.host()?;
        let endpoint = request.endpoint()?;
        Ok(Target {
            bucket_key: self.resolver.resolve_endpoint(&host, &endpoint),
            endpoint,
        })
    }

    fn bucket(&self, key: &str) -> Result<Arc<Mutex<TokenBucket>>> {
        {
            let buckets = self
                .buckets
                .read()
                .map_err(|_| ThrottlerError::poisoned("buckets"))?;
            if let Some(bucket) = buckets.get(key) {
                return Ok(Arc::clone(bucket));
            }
        }

        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| ThrottlerError::poisoned("buckets"))?;
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(bucket = %key, "Creating token bucket");
            Arc::new(Mutex::new(TokenBucket::new(
                self.config.burst,
                self.config.steady_rate,
                self.clock.now(),
            )))
        });
        Ok(Arc::clone(bucket))
    }

    fn with_existing_bucket<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut TokenBucket, f64) -> T,
    ) -> Result<Option<T>> {
        let bucket = {
            let buckets = self
                .buckets
                .read()
                .map_err(|_| ThrottlerError::poisoned("buckets"))?;
            match buckets.get(key) {
                Some(bucket) => Arc::clone(bucket),
                None => return Ok(None),
            }
        };
        let mut bucket = bucket
            .lock()
            .map_err(|_| ThrottlerError::poisoned("bucket"))?;
        Ok(Some(f(&mut bucket, self.clock.now())))
    }

    fn grant(
        &self,
        target: Target,
        permit: GatePermit,
        waited: Duration,
        tokens_left: f64,
    ) -> Result<RateLimitGuard> {
        let now = self.clock.now();
        self.stats.record_request(waited, now)?;

        let decision = if waited.is_zero() {
            Decision::Allow
        } else {
            Decision::Throttle
        };
        self.sink.record(
            TelemetryEvent::new(now, &self.config.host, &target.endpoint, decision)
                .with_sleep(waited.as_secs_f64())
                .with_bucket(&target.bucket_key, tokens_left),
        );

        Ok(RateLimitGuard {
            _permit: permit,
            wait: waited,
            bucket_key: target.bucket_key,
        })
    }

    /// Returns the number of earlier retries of this class and counts this one.
    fn next_attempt(
        &self,
        request_id: Option<&str>,
        class: RetryClass,
        observed: u32,
    ) -> Result<u32> {
        let Some(id) = request_id else {
            return Ok(observed);
        };

        let mut states = self
            .retry_state
            .lock()
            .map_err(|_| ThrottlerError::poisoned("retry state"))?;
        let state = states.entry(id.to_string()).or_default();
        let counter = match class {
            RetryClass::RateLimited => &mut state.retries_429,
            RetryClass::ServerError => &mut state.retries_5xx,
        };
        let attempt = *counter;
        *counter += 1;
        Ok(attempt)
    }

    fn clear_retry_state(&self, request_id: Option<&str>) -> Result<()> {
        if let Some(id) = request_id {
            self.retry_state
                .lock()
                .map_err(|_| ThrottlerError::poisoned("retry state"))?
                .remove(id);
        }
        Ok(())
    }
}

fn secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}
