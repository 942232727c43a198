use crate::clock::{Clock, SystemClock};
use crate::error::{Result, ThrottlerError};
use crate::metrics::RateLimiterStats;
use crate::rate_limit_config::{ExchangeConfig, LimitsConfig};
use crate::rate_limiter::RateLimiter;
use crate::telemetry::{TelemetrySink, TracingSink};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Registry of per-exchange rate limiters.
///
/// Limiters are created on first use and shared afterwards, so every caller
/// of one exchange draws from the same buckets and concurrency gate. All
/// limiters share one clock and one telemetry sink.
pub struct Throttler {
    limits: LimitsConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl Throttler {
    /// Create a throttler on the system clock, logging through `tracing`
    pub fn new(limits: LimitsConfig) -> Result<Self> {
        Self::with_parts(limits, Arc::new(SystemClock), Arc::new(TracingSink::default()))
    }

    pub fn with_parts(
        limits: LimitsConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        limits.validate()?;
        info!(exchanges = ?limits.exchange_names(), "Throttler configured");

        Ok(Self {
            limits,
            clock,
            sink,
            limiters: RwLock::new(HashMap::new()),
        })
    }

    /// Load limits from a YAML file, falling back to defaults when it is missing
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(LimitsConfig::load_or_default(path)?)
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Limiter for a configured exchange
    pub fn limiter(&self, exchange: &str) -> Result<Arc<RateLimiter>> {
        let config = self.limits.get_exchange(exchange).cloned().ok_or_else(|| {
            ThrottlerError::Config(format!("Unknown exchange '{}'", exchange))
        })?;
        self.limiter_with(exchange, config)
    }

    /// Limiter for `exchange`, using default settings when it is not configured
    pub fn limiter_or_default(&self, exchange: &str) -> Result<Arc<RateLimiter>> {
        let config = self.limits.get_exchange_or_default(exchange);
        self.limiter_with(exchange, config)
    }

    /// Stats for every limiter created so far, by exchange name
    pub fn stats(&self) -> Result<BTreeMap<String, RateLimiterStats>> {
        let limiters = self
            .limiters
            .read()
            .map_err(|_| ThrottlerError::poisoned("limiters"))?;
        limiters
            .iter()
            .map(|(name, limiter)| Ok((name.clone(), limiter.get_stats()?)))
            .collect()
    }

    pub fn status(&self) -> Result<Vec<ExchangeStatus>> {
        let limiters = self
            .limiters
            .read()
            .map_err(|_| ThrottlerError::poisoned("limiters"))?;

        let mut status = Vec::with_capacity(limiters.len());
        for (name, limiter) in limiters.iter() {
            let config = limiter.config();
            status.push(ExchangeStatus {
                exchange: name.clone(),
                host: config.host.clone(),
                steady_rate: config.steady_rate,
                burst: config.burst,
                in_flight: limiter.gate().in_flight(),
                buckets: limiter.bucket_keys()?,
                stats: limiter.get_stats()?,
            });
        }
        status.sort_by(|a, b| a.exchange.cmp(&b.exchange));
        Ok(status)
    }

    pub fn reset_stats(&self) -> Result<()> {
        let limiters = self
            .limiters
            .read()
            .map_err(|_| ThrottlerError::poisoned("limiters"))?;
        for limiter in limiters.values() {
            limiter.reset_stats()?;
        }
        Ok(())
    }

    fn limiter_with(&self, exchange: &str, config: ExchangeConfig) -> Result<Arc<RateLimiter>> {
        {
            let limiters = self
                .limiters
                .read()
                .map_err(|_| ThrottlerError::poisoned("limiters"))?;
            if let Some(limiter) = limiters.get(exchange) {
                return Ok(Arc::clone(limiter));
            }
        }

        let mut limiters = self
            .limiters
            .write()
            .map_err(|_| ThrottlerError::poisoned("limiters"))?;
        if let Some(limiter) = limiters.get(exchange) {
            return Ok(Arc::clone(limiter));
        }

        let limiter = Arc::new(RateLimiter::with_parts(
            config,
            Arc::clone(&self.clock),
            Arc::clone(&self.sink),
        )?);
        limiters.insert(exchange.to_string(), Arc::clone(&limiter));
        Ok(limiter)
    }
}

/// Snapshot of one exchange's limiter
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatus {
    pub exchange: String,
    pub host: String,
    pub steady_rate: f64,
    pub burst: u32,
    pub in_flight: usize,
    pub buckets: Vec<String>,
    pub stats: RateLimiterStats,
}
