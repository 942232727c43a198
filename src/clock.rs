//! Time source used by buckets, backoff and the limiter's wait loop.
//!
//! All timestamps are Unix seconds as `f64`, which is also how servers
//! report `X-RateLimit-Reset`.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in Unix seconds.
    fn now(&self) -> f64;

    /// Block the calling thread for `duration`.
    fn sleep_blocking(&self, duration: Duration);

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn sleep_blocking(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests and simulations.
///
/// Sleeping advances the virtual time by the requested duration and returns
/// immediately; the async variant also yields so other tasks get to run.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<f64>,
}

impl FakeClock {
    pub fn new(initial: f64) -> Self {
        Self {
            now: Mutex::new(initial),
        }
    }

    pub fn advance(&self, seconds: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += seconds;
    }

    pub fn set(&self, timestamp: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = timestamp;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sleep_blocking(&self, duration: Duration) {
        self.advance(duration.as_secs_f64());
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration.as_secs_f64());
        tokio::task::yield_now().await;
    }
}
