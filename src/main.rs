use adaptive_throttler::{
    Clock, EventFormat, FakeClock, FanoutSink, HeaderNames, LimitsConfig, MemorySink,
    ObservedResponse, RequestSpec, TelemetrySink, Throttler, TracingSink,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Drive an exchange's limiter through a scripted sequence of responses on a
/// simulated clock.
#[derive(Debug, Parser)]
#[command(name = "throttler-sim", version, about)]
struct Args {
    /// Limits file (YAML)
    #[arg(short, long, default_value = "config/limits.yml")]
    limits: PathBuf,

    /// Exchange to simulate
    #[arg(short, long, default_value = "default")]
    exchange: String,

    /// Endpoint path requested on the exchange host
    #[arg(long, default_value = "/v1/markets")]
    endpoint: String,

    /// HTTP method
    #[arg(long, default_value = "GET")]
    method: String,

    /// Number of logical requests to send
    #[arg(short = 'n', long, default_value_t = 50)]
    requests: u32,

    /// Response statuses returned in turn, cycling
    #[arg(short, long, value_delimiter = ',', default_value = "200")]
    statuses: Vec<u16>,

    /// Retry-After value attached to simulated 429 responses
    #[arg(long)]
    retry_after: Option<String>,

    /// Simulated latency of each response, in milliseconds
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Unix timestamp the simulated clock starts at
    #[arg(long, default_value_t = 1_700_000_000.0)]
    start: f64,

    /// Telemetry log format: json or keyvalue
    #[arg(long, default_value = "json")]
    format: EventFormat,

    /// Log every telemetry event at DEBUG
    #[arg(short, long)]
    verbose: bool,
}

/// A scripted response. 429s carry `retry_after` under the exchange's
/// configured header name.
fn simulated_response(
    status: u16,
    latency: Duration,
    retry_after: Option<&str>,
    names: &HeaderNames,
) -> ObservedResponse {
    let response = ObservedResponse::new(status).with_elapsed(latency);
    match retry_after {
        Some(value) if status == 429 => response.with_header(names.retry_after.clone(), value),
        _ => response,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adaptive_throttler=info,throttler_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if args.statuses.is_empty() {
        bail!("At least one status is required");
    }

    let limits = LimitsConfig::load_or_default(&args.limits)
        .with_context(|| format!("Failed to load limits from {}", args.limits.display()))?;

    let clock = Arc::new(FakeClock::new(args.start));
    let memory = Arc::new(MemorySink::new());
    let sink = FanoutSink::new(vec![
        memory.clone() as Arc<dyn TelemetrySink>,
        Arc::new(TracingSink::new(args.format, args.verbose)),
    ]);

    let throttler = Throttler::with_parts(limits, clock.clone(), Arc::new(sink))
        .context("Failed to build throttler")?;
    let limiter = throttler
        .limiter_or_default(&args.exchange)
        .with_context(|| format!("Failed to build limiter for '{}'", args.exchange))?;

    let url = format!("https://{}{}", limiter.config().host, args.endpoint);
    let request = RequestSpec::new(args.method.to_uppercase(), url);
    tracing::info!(
        exchange = %args.exchange,
        url = %request.url,
        requests = args.requests,
        statuses = ?args.statuses,
        "Starting simulation"
    );

    let mut script = args.statuses.iter().copied().cycle();
    let mut completed = 0u32;
    let mut failed = 0u32;
    let mut sent = 0u32;

    for _ in 0..args.requests {
        let request_id = Uuid::new_v4().to_string();

        loop {
            let guard = limiter.acquire(&request).await?;
            let status = script.next().unwrap_or(200);
            sent += 1;

            let response = simulated_response(
                status,
                Duration::from_millis(args.latency_ms),
                args.retry_after.as_deref(),
                &limiter.config().headers,
            );
            clock.sleep(response.elapsed).await;
            limiter.release(guard);

            let decision = limiter.handle_response(&request, &response, Some(&request_id))?;
            if !decision.wait.is_zero() {
                clock.sleep(decision.wait).await;
            }
            if decision.should_retry {
                continue;
            }
            if (200..400).contains(&status) {
                completed += 1;
            } else {
                failed += 1;
                tracing::warn!(request_id = %request_id, status, reason = %decision.reason, "Request failed");
            }
            break;
        }
    }

    let report = json!({
        "exchange": args.exchange,
        "host": limiter.config().host,
        "requests": args.requests,
        "attempts": sent,
        "completed": completed,
        "failed": failed,
        "simulated_seconds": clock.now() - args.start,
        "stats": limiter.get_stats()?,
        "buckets": limiter.bucket_keys()?,
        "telemetry": memory.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_throttler::{ExchangeConfig, RateLimiter};

    #[test]
    fn test_retry_after_uses_configured_header_name() {
        let mut config = ExchangeConfig::new("api.test.com", 10.0, 20, 4);
        config.headers.retry_after = "X-Retry-In".to_string();

        let response =
            simulated_response(429, Duration::from_millis(50), Some("7"), &config.headers);
        assert_eq!(response.headers.get("X-Retry-In").map(String::as_str), Some("7"));
        assert!(!response.headers.contains_key("Retry-After"));

        let limiter = RateLimiter::with_parts(
            config,
            Arc::new(FakeClock::new(0.0)),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        let request = RequestSpec::get("https://api.test.com/v1/markets");
        let decision = limiter.handle_response(&request, &response, None).unwrap();
        assert_eq!(decision.wait, Duration::from_secs(7));
    }

    #[test]
    fn test_retry_after_only_on_429() {
        let names = HeaderNames::default();
        let response = simulated_response(503, Duration::ZERO, Some("7"), &names);
        assert!(response.headers.is_empty());
    }
}
