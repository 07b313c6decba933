//! Gateway assembly.
//!
//! [`Gateway`] owns every piece of shared state (client registry, response
//! cache, counters) and the stage chain built over it:
//!
//! ```text
//! Logger → Metrics → CORS → RateLimit → Cache → Forward
//! ```
//!
//! Rate limiting always runs before the cache, so a cached response is
//! never served to a client that is over its limit. Requests to the admin
//! endpoints under `/gateway/` bypass the chain entirely.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    Request, Response, StatusCode,
    background::PeriodicTask,
    cache::{CacheMiddleware, ResponseCache},
    config::{ConfigError, GatewayConfig},
    context::Context,
    metrics::{GatewayMetrics, MetricsMiddleware, PROMETHEUS_CONTENT_TYPE, success_rate},
    middleware::{BoxResponse, LoggerMiddleware, MiddlewareHandler, Next, from_middleware},
    proxy::{ForwardMiddleware, Forwarder, HttpForwarder},
    ratelimit::{ClientRegistry, RateLimitMiddleware},
    router::Router,
    security::CorsMiddleware,
};

pub const HEALTH_PATH: &str = "/gateway/health";
pub const STATS_PATH: &str = "/gateway/stats";
pub const METRICS_PATH: &str = "/gateway/metrics";

const SERVICE_NAME: &str = "visara-gateway";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised while assembling a [`Gateway`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to register gateway metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// The assembled gateway.
///
/// Construct with [`Gateway::new`] (or [`Gateway::from_config`]), call
/// [`start`](Self::start) from inside a Tokio runtime to launch the
/// maintenance sweeps, feed requests through [`handle`](Self::handle), and
/// finish with [`shutdown`](Self::shutdown).
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ClientRegistry>,
    cache: Arc<ResponseCache>,
    metrics: Arc<GatewayMetrics>,
    router: Router,
    sweeps: Mutex<Vec<PeriodicTask>>,
}

impl Gateway {
    /// Builds the gateway around an already constructed forwarder.
    ///
    /// The configuration is taken as given; see [`GatewayConfig::validate`].
    pub fn new(config: GatewayConfig, forwarder: Arc<dyn Forwarder>) -> Result<Self, GatewayError> {
        let registry = Arc::new(ClientRegistry::new(
            f64::from(config.rate_limit.requests_per_second),
            f64::from(config.rate_limit.burst),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.ttl()));
        let metrics = Arc::new(GatewayMetrics::new()?);

        let mut stages: Vec<MiddlewareHandler> = vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(MetricsMiddleware::new(Arc::clone(&metrics)))),
            from_middleware(Arc::new(CorsMiddleware::new(&config.cors))),
            from_middleware(Arc::new(
                RateLimitMiddleware::new(Arc::clone(&registry), config.rate_limit.requests_per_second)
                    .with_metrics(Arc::clone(&metrics)),
            )),
        ];
        if config.cache.enabled {
            stages.push(from_middleware(Arc::new(CacheMiddleware::new(Arc::clone(&cache)))));
        }
        stages.push(from_middleware(Arc::new(ForwardMiddleware::new(forwarder))));
        let chain: Arc<[MiddlewareHandler]> = stages.into();

        let router = admin_router(&config, &registry, &cache, &metrics, chain);

        Ok(Self {
            config,
            registry,
            cache,
            metrics,
            router,
            sweeps: Mutex::new(Vec::new()),
        })
    }

    /// Validates `config` and builds a gateway forwarding to its backend over HTTP.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let forwarder = HttpForwarder::new(config.backend.upstream()?, config.backend.timeout());
        Self::new(config, Arc::new(forwarder))
    }

    /// Starts the registry and cache sweeps. Calling it again is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self) {
        let mut sweeps = self.sweeps.lock();
        if !sweeps.is_empty() {
            warn!("gateway already started");
            return;
        }

        let limits = &self.config.rate_limit;
        sweeps.push(
            self.registry
                .spawn_sweeper(limits.sweep_interval(), limits.idle_timeout()),
        );
        if self.config.cache.enabled {
            sweeps.push(self.cache.spawn_sweeper(self.config.cache.sweep_interval()));
        }

        info!(
            backend = %self.config.backend.url,
            rate_limit = %self.config.rate_limit_summary(),
            cache_enabled = self.config.cache.enabled,
            cache_ttl = ?self.config.cache.ttl(),
            "gateway started"
        );
    }

    /// Stops the sweeps and waits for them to finish.
    pub async fn shutdown(&self) {
        let sweeps = std::mem::take(&mut *self.sweeps.lock());
        for task in sweeps {
            task.shutdown().await;
        }
        info!("gateway stopped");
    }

    /// Routes one request through the admin endpoints or the stage chain.
    pub fn handle(&self, request: Request) -> BoxResponse {
        self.router.handle(Context::new(request))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }
}

// ── Admin endpoints ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

#[derive(Debug, Serialize)]
struct Stats {
    version: &'static str,
    backend: String,
    uptime_secs: u64,
    request_count: u64,
    error_count: u64,
    rate_limited_count: u64,
    success_rate: String,
    cache_enabled: bool,
    cache_entries: usize,
    cache_hits: u64,
    cache_misses: u64,
    tracked_clients: usize,
    rate_limit: String,
}

fn admin_router(
    config: &GatewayConfig,
    registry: &Arc<ClientRegistry>,
    cache: &Arc<ResponseCache>,
    metrics: &Arc<GatewayMetrics>,
    chain: Arc<[MiddlewareHandler]>,
) -> Router {
    let mut router = Router::new();

    let m = Arc::clone(metrics);
    router.get(HEALTH_PATH, move |_ctx: Context| {
        let health = Health {
            status: "healthy",
            service: SERVICE_NAME,
            version: VERSION,
            uptime_secs: m.uptime().as_secs(),
        };
        async move { Response::json(StatusCode::OK, &health) }
    });

    let (m, c, r) = (Arc::clone(metrics), Arc::clone(cache), Arc::clone(registry));
    let backend = config.backend.url.clone();
    let rate_limit = config.rate_limit_summary();
    let cache_enabled = config.cache.enabled;
    router.get(STATS_PATH, move |_ctx: Context| {
        let s = m.snapshot();
        let stats = Stats {
            version: VERSION,
            backend: backend.clone(),
            uptime_secs: s.uptime_secs as u64,
            request_count: s.requests_total,
            error_count: s.requests_error,
            rate_limited_count: s.rate_limited,
            success_rate: success_rate(s.requests_total, s.requests_error)
                .map_or_else(|| "N/A".to_owned(), |rate| format!("{rate:.2}%")),
            cache_enabled,
            cache_entries: c.len(),
            cache_hits: s.cache_hits,
            cache_misses: s.cache_misses,
            tracked_clients: r.len(),
            rate_limit: rate_limit.clone(),
        };
        async move { Response::json(StatusCode::OK, &stats) }
    });

    let (m, c, r) = (Arc::clone(metrics), Arc::clone(cache), Arc::clone(registry));
    router.get(METRICS_PATH, move |_ctx: Context| {
        let rendered = m.render_prometheus(c.len(), r.len());
        async move {
            match rendered {
                Ok(body) => Response::new(StatusCode::OK)
                    .header("Content-Type", PROMETHEUS_CONTENT_TYPE)
                    .body(body),
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
    });

    router.fallback(move |ctx: Context| Next::new(Arc::clone(&chain)).run(ctx));
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;
    use crate::proxy::{ForwardFuture, ProxyError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    impl Forwarder for CountingBackend {
        fn forward(&self, request: Request) -> ForwardFuture<'_> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                Ok::<_, ProxyError>(
                    Response::new(StatusCode::OK)
                        .header("Content-Type", "text/plain")
                        .body(format!("{} #{n}", request.target())),
                )
            })
        }
    }

    fn config(burst: u32, cache_enabled: bool) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.rate_limit.requests_per_second = 10;
        config.rate_limit.burst = burst;
        config.cache.enabled = cache_enabled;
        config
    }

    fn gateway(burst: u32, cache_enabled: bool) -> (Gateway, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend::default());
        let forwarder: Arc<dyn Forwarder> = backend.clone();
        (Gateway::new(config(burst, cache_enabled), forwarder).unwrap(), backend)
    }

    fn get(target: &str) -> Request {
        Request::new(Method::Get, target).with_peer_addr("198.51.100.4:3000".parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_gates_cache_hits() {
        let (gw, backend) = gateway(2, true);

        let first = gw.handle(get("/x")).await;
        assert_eq!(first.headers().get("x-cache"), Some("MISS"));
        let second = gw.handle(get("/x")).await;
        assert_eq!(second.headers().get("x-cache"), Some("HIT"));
        assert_eq!(second.bytes(), first.bytes());

        let third = gw.handle(get("/x")).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(third.headers().get("x-cache").is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn post_always_reaches_backend() {
        let (gw, backend) = gateway(200, true);
        for _ in 0..100 {
            let req = Request::new(Method::Post, "/x").with_peer_addr("198.51.100.4:3000".parse().unwrap());
            let res = gw.handle(req).await;
            assert_eq!(res.status(), StatusCode::OK);
            assert!(res.headers().get("x-cache").is_none());
        }
        assert!(gw.cache().is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_cache_is_left_out() {
        let (gw, backend) = gateway(20, false);
        gw.handle(get("/x")).await;
        let res = gw.handle(get("/x")).await;
        assert!(res.headers().get("x-cache").is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_carry_stage_headers() {
        let (gw, _) = gateway(20, true);
        let res = gw.handle(get("/x")).await;
        assert_eq!(res.headers().get("x-ratelimit-limit"), Some("10"));
        assert_eq!(res.headers().get("access-control-allow-origin"), Some("*"));
    }

    #[tokio::test(start_paused = true)]
    async fn admin_endpoints_bypass_rate_limit() {
        let (gw, backend) = gateway(1, true);
        for _ in 0..5 {
            let res = gw.handle(get(HEALTH_PATH)).await;
            assert_eq!(res.status(), StatusCode::OK);
            let body: serde_json::Value = serde_json::from_slice(res.bytes()).unwrap();
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["service"], "visara-gateway");
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(gw.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_and_metrics_reflect_traffic() {
        let (gw, _) = gateway(1, true);
        gw.handle(get("/a")).await;
        gw.handle(get("/a")).await; // rejected

        let stats = gw.handle(get(STATS_PATH)).await;
        let body: serde_json::Value = serde_json::from_slice(stats.bytes()).unwrap();
        assert_eq!(body["request_count"], 2);
        assert_eq!(body["error_count"], 1);
        assert_eq!(body["rate_limited_count"], 1);
        assert_eq!(body["success_rate"], "50.00%");
        assert_eq!(body["cache_entries"], 1);
        assert_eq!(body["tracked_clients"], 1);

        let metrics = gw.handle(get(METRICS_PATH)).await;
        assert_eq!(metrics.headers().get("content-type"), Some(PROMETHEUS_CONTENT_TYPE));
        let text = std::str::from_utf8(metrics.bytes()).unwrap();
        assert!(text.contains("gateway_requests_total 2\n"));
    }

    struct BusyBackend;

    impl Forwarder for BusyBackend {
        fn forward(&self, _request: Request) -> ForwardFuture<'_> {
            Box::pin(async { Ok::<_, ProxyError>(Response::new(StatusCode::TOO_MANY_REQUESTS).body("slow down")) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backend_429_is_not_counted_as_rate_limited() {
        let gw = Gateway::new(config(20, true), Arc::new(BusyBackend)).unwrap();
        let res = gw.handle(get("/x")).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        let s = gw.metrics().snapshot();
        assert_eq!(s.requests_error, 1);
        assert_eq!(s.rate_limited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_run_between_start_and_shutdown() {
        let mut config = config(20, true);
        config.rate_limit.idle_timeout_secs = 10;
        config.rate_limit.sweep_interval_secs = 30;
        config.cache.ttl_secs = 5;
        config.cache.sweep_interval_secs = 30;
        let gw = Gateway::new(config, Arc::new(CountingBackend::default())).unwrap();

        gw.start();
        gw.start();
        gw.handle(get("/x")).await;
        assert_eq!(gw.registry().len(), 1);
        assert_eq!(gw.cache().len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(gw.registry().is_empty());
        assert!(gw.cache().is_empty());

        gw.shutdown().await;
    }
}
