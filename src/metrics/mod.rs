//! Request counters and their Prometheus text exposition.
//!
//! Counters live on a private [`prometheus::Registry`] owned by
//! [`GatewayMetrics`]; `/gateway/metrics` renders it with the text encoder.

use std::sync::Arc;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    StatusCode,
    cache::CACHE_STATUS_HEADER,
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

/// Content type of the Prometheus text format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Gateway counters registered on their own Prometheus registry.
///
/// Every proxied request is counted once, after its response is known.
/// Responses with a status of 400 or above count as errors. Rate-limit
/// rejections are reported separately by the rate-limit stage, so a `429`
/// relayed from the backend is not mistaken for one.
pub struct GatewayMetrics {
    started_at: Instant,
    registry: Registry,
    requests_total: IntCounter,
    requests_success: IntCounter,
    requests_error: IntCounter,
    rate_limited: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    bytes_sent: IntCounter,
    uptime_seconds: Gauge,
    cache_entries: IntGauge,
    tracked_clients: IntGauge,
    success_rate: Gauge,
}

/// Point-in-time copy of [`GatewayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub rate_limited: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_sent: u64,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl GatewayMetrics {
    /// Creates the counters and registers them on a fresh registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            register(&registry, IntCounter::new(name, help)?)
        };

        Ok(Self {
            started_at: Instant::now(),
            requests_total: counter("gateway_requests_total", "Total number of requests")?,
            requests_success: counter("gateway_requests_success", "Requests answered below 400")?,
            requests_error: counter("gateway_requests_error", "Requests answered with 400 or above")?,
            rate_limited: counter("gateway_rate_limited_total", "Requests rejected by the rate limiter")?,
            cache_hits: counter("gateway_cache_hits_total", "Responses served from cache")?,
            cache_misses: counter("gateway_cache_misses_total", "Cacheable requests that missed")?,
            bytes_sent: counter("gateway_bytes_transferred", "Response body bytes sent")?,
            uptime_seconds: register(&registry, Gauge::new("gateway_uptime_seconds", "Gateway uptime in seconds")?)?,
            cache_entries: register(
                &registry,
                IntGauge::new("gateway_cache_entries", "Entries currently held in the response cache")?,
            )?,
            tracked_clients: register(
                &registry,
                IntGauge::new("gateway_tracked_clients", "Clients with a live token bucket")?,
            )?,
            success_rate: register(&registry, Gauge::new("gateway_success_rate", "Success rate percentage")?)?,
            registry,
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Records one completed request.
    ///
    /// `cache` is the value of the `X-Cache` response header, if any.
    pub fn record(&self, status: StatusCode, body_len: usize, cache: Option<&str>) {
        self.requests_total.inc();
        if status.as_u16() >= 400 {
            self.requests_error.inc();
        } else {
            self.requests_success.inc();
        }
        match cache {
            Some("HIT") => self.cache_hits.inc(),
            Some("MISS") => self.cache_misses.inc(),
            _ => {}
        }
        self.bytes_sent.inc_by(body_len as u64);
    }

    /// Records one request turned away by the rate limiter.
    pub fn record_rate_limited(&self) {
        self.rate_limited.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs_f64(),
            requests_total: self.requests_total.get(),
            requests_success: self.requests_success.get(),
            requests_error: self.requests_error.get(),
            rate_limited: self.rate_limited.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            bytes_sent: self.bytes_sent.get(),
        }
    }

    /// Refreshes the gauges and encodes the registry in the Prometheus text format.
    pub fn render_prometheus(&self, cache_entries: usize, tracked_clients: usize) -> Result<String, prometheus::Error> {
        self.uptime_seconds.set(self.uptime().as_secs_f64());
        self.cache_entries.set(i64::try_from(cache_entries).unwrap_or(i64::MAX));
        self.tracked_clients.set(i64::try_from(tracked_clients).unwrap_or(i64::MAX));
        let rate = success_rate(self.requests_total.get(), self.requests_error.get());
        self.success_rate.set(rate.unwrap_or(100.0));

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Percentage of requests that did not fail, or `None` before the first request.
pub fn success_rate(total: u64, errors: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(errors) as f64 / total as f64 * 100.0)
}

/// Counts every request that passes through it. Never short-circuits.
pub struct MetricsMiddleware {
    metrics: Arc<GatewayMetrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self { metrics }
    }
}

impl Middleware for MetricsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let metrics = Arc::clone(&self.metrics);
        Box::pin(async move {
            let response = next.run(ctx).await;
            metrics.record(
                response.status(),
                response.bytes().len(),
                response.headers().get(CACHE_STATUS_HEADER),
            );
            response
        })
    }
}
