//! Structured telemetry for limiter decisions.
//!
//! The limiter builds one [`TelemetryEvent`] per decision point and hands it
//! to the [`TelemetrySink`] it was constructed with. Sinks own any history.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Token granted without waiting.
    #[serde(rename = "allow")]
    Allow,
    /// Token granted after waiting for refill or a server reset.
    #[serde(rename = "throttle")]
    Throttle,
    #[serde(rename = "backoff_429")]
    Backoff429,
    #[serde(rename = "backoff_5xx")]
    Backoff5xx,
    /// Server rate limit headers were applied to a bucket.
    #[serde(rename = "adaptive")]
    Adaptive,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Throttle => "throttle",
            Decision::Backoff429 => "backoff_429",
            Decision::Backoff5xx => "backoff_5xx",
            Decision::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// ISO-8601, UTC.
    pub timestamp: String,
    pub exchange: String,
    pub endpoint: String,
    pub status: Option<u16>,
    pub elapsed_ms: f64,
    pub decision: Decision,
    pub sleep_s: f64,
    pub headers_seen: BTreeMap<String, String>,
    pub bucket_key: String,
    pub attempt: u32,
    pub tokens_available: f64,
}

impl TelemetryEvent {
    /// An event stamped at `now` (Unix seconds).
    pub fn new(now: f64, exchange: &str, endpoint: &str, decision: Decision) -> Self {
        Self {
            timestamp: format_timestamp(now),
            exchange: exchange.to_string(),
            endpoint: endpoint.to_string(),
            status: None,
            elapsed_ms: 0.0,
            decision,
            sleep_s: 0.0,
            headers_seen: BTreeMap::new(),
            bucket_key: String::new(),
            attempt: 0,
            tokens_available: 0.0,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: f64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_sleep(mut self, sleep_s: f64) -> Self {
        self.sleep_s = sleep_s;
        self
    }

    pub fn with_headers(mut self, headers_seen: BTreeMap<String, String>) -> Self {
        self.headers_seen = headers_seen;
        self
    }

    pub fn with_bucket(mut self, bucket_key: &str, tokens_available: f64) -> Self {
        self.bucket_key = bucket_key.to_string();
        self.tokens_available = tokens_available;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }

    /// `key=value` pairs with nested headers flattened as `headers_seen.Name=v`.
    pub fn to_keyvalue(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        let mut pairs = vec![
            format!("timestamp={}", self.timestamp),
            format!("exchange={}", self.exchange),
            format!("endpoint={}", self.endpoint),
            format!("status={}", status),
            format!("elapsed_ms={}", self.elapsed_ms),
            format!("decision={}", self.decision),
            format!("sleep_s={}", self.sleep_s),
        ];
        pairs.extend(
            self.headers_seen
                .iter()
                .map(|(name, value)| format!("headers_seen.{}={}", name, value)),
        );
        pairs.push(format!("bucket_key={}", self.bucket_key));
        pairs.push(format!("attempt={}", self.attempt));
        pairs.push(format!("tokens_available={}", self.tokens_available));
        pairs.join(" ")
    }

    /// Throttling, backoff and adaptation, or any error status.
    pub fn is_notable(&self) -> bool {
        self.decision != Decision::Allow || self.status.is_some_and(|s| s >= 400)
    }
}

fn format_timestamp(now: f64) -> String {
    DateTime::<Utc>::from_timestamp_millis((now * 1000.0).round() as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| now.to_string())
}

/// Receives every event the limiter emits.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _event: TelemetryEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFormat {
    #[default]
    Json,
    KeyValue,
}

impl FromStr for EventFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(EventFormat::Json),
            "keyvalue" | "kv" => Ok(EventFormat::KeyValue),
            other => Err(format!("Unknown event format '{}'", other)),
        }
    }
}

/// Logs events through `tracing`.
///
/// Notable events go out at INFO and routine grants at DEBUG, unless
/// `verbose` is set, in which case everything is logged at DEBUG.
#[derive(Debug, Default, Clone)]
pub struct TracingSink {
    format: EventFormat,
    verbose: bool,
}

impl TracingSink {
    pub fn new(format: EventFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    fn render(&self, event: &TelemetryEvent) -> String {
        match self.format {
            EventFormat::Json => event.to_json(),
            EventFormat::KeyValue => event.to_keyvalue(),
        }
    }
}

impl TelemetrySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        let message = self.render(&event);
        if !self.verbose && event.is_notable() {
            info!(target: "adaptive_throttler::telemetry", decision = %event.decision, "{}", message);
        } else {
            debug!(target: "adaptive_throttler::telemetry", decision = %event.decision, "{}", message);
        }
    }
}

/// Hands every event to each of its sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }
}

impl TelemetrySink for FanoutSink {
    fn record(&self, event: TelemetryEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Aggregates over recorded events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub total_events: u64,
    pub total_sleeps: u64,
    pub total_sleep_time: f64,
    pub total_elapsed_ms: f64,
    pub decisions_by_type: BTreeMap<String, u64>,
    pub status_codes: BTreeMap<u16, u64>,
}

impl TelemetryStats {
    pub fn avg_elapsed_ms(&self) -> f64 {
        if self.total_events == 0 {
            0.0
        } else {
            self.total_elapsed_ms / self.total_events as f64
        }
    }

    fn observe(&mut self, event: &TelemetryEvent) {
        self.total_events += 1;
        self.total_elapsed_ms += event.elapsed_ms;
        if event.sleep_s > 0.0 {
            self.total_sleeps += 1;
            self.total_sleep_time += event.sleep_s;
        }
        *self
            .decisions_by_type
            .entry(event.decision.as_str().to_string())
            .or_insert(0) += 1;
        if let Some(status) = event.status {
            *self.status_codes.entry(status).or_insert(0) += 1;
        }
    }
}

/// Keeps every event in memory, with running aggregates.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
    stats: Mutex<TelemetryStats>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events_with(&self, decision: Decision) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.decision == decision)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn stats(&self) -> TelemetryStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = TelemetryStats::default();
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, event: TelemetryEvent) {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(&event);
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
