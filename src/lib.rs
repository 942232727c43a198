pub mod backoff;
pub mod clock;
pub mod config_validator;
pub mod error;
pub mod gate;
pub mod headers;
pub mod key_generator;
pub mod metrics;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod request;
pub mod response;
pub mod telemetry;
pub mod throttler;
pub mod token_bucket;

pub use backoff::{parse_retry_after, BackoffPolicy};
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{Result, ThrottlerError};
pub use metrics::RateLimiterStats;
pub use rate_limit_config::{BucketConfig, ExchangeConfig, HeaderNames, LimitsConfig, RetryPolicy};
pub use rate_limiter::{RateLimitGuard, RateLimiter};
pub use request::RequestSpec;
pub use response::{ObservedResponse, ResponseDecision};
pub use telemetry::{
    Decision, EventFormat, FanoutSink, MemorySink, NoopSink, TelemetryEvent, TelemetrySink,
    TracingSink,
};
pub use throttler::Throttler;
pub use token_bucket::TokenBucket;
