use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, ThrottlerError};

/// Aggregate limiter counters. Snapshots are plain copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub requests_total: u64,
    pub requests_throttled: u64,
    pub requests_429: u64,
    pub requests_5xx: u64,
    /// Seconds spent waiting for tokens inside `acquire`.
    pub total_wait: f64,
    pub adaptive_adjustments: u64,
    pub last_request_at: Option<f64>,
}

/// Lock-guarded stats shared by all buckets of one limiter.
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: Mutex<RateLimiterStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, wait: Duration, now: f64) -> Result<()> {
        self.update(|stats| {
            stats.requests_total += 1;
            stats.total_wait += wait.as_secs_f64();
            stats.last_request_at = Some(now);
            if !wait.is_zero() {
                stats.requests_throttled += 1;
            }
        })
    }

    pub fn record_throttle(&self) -> Result<()> {
        self.update(|stats| stats.requests_throttled += 1)
    }

    pub fn record_429(&self) -> Result<()> {
        self.update(|stats| stats.requests_429 += 1)
    }

    pub fn record_5xx(&self) -> Result<()> {
        self.update(|stats| stats.requests_5xx += 1)
    }

    pub fn record_adaptive_adjustment(&self) -> Result<()> {
        self.update(|stats| stats.adaptive_adjustments += 1)
    }

    pub fn snapshot(&self) -> Result<RateLimiterStats> {
        let stats = self
            .stats
            .lock()
            .map_err(|_| ThrottlerError::poisoned("stats"))?;
        Ok(stats.clone())
    }

    pub fn reset(&self) -> Result<()> {
        self.update(|stats| *stats = RateLimiterStats::default())
    }

    fn update(&self, f: impl FnOnce(&mut RateLimiterStats)) -> Result<()> {
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| ThrottlerError::poisoned("stats"))?;
        f(&mut stats);
        Ok(())
    }
}
