use std::sync::Arc;

use serde::Serialize;

use super::{ClientId, ClientRegistry};
use crate::{
    Response, StatusCode,
    context::Context,
    metrics::GatewayMetrics,
    middleware::{BoxResponse, Middleware, Next},
};

/// Response header carrying the configured per-second limit.
pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
/// Response header carrying the remaining allowance; only sent on rejection.
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";

/// Body of a `429 Too Many Requests` rejection.
#[derive(Debug, Serialize)]
pub struct RateLimitRejection {
    pub error: &'static str,
    pub message: &'static str,
}

impl RateLimitRejection {
    pub const CODE: &'static str = "rate_limit_exceeded";

    fn new() -> Self {
        Self {
            error: Self::CODE,
            message: "Too many requests. Please slow down.",
        }
    }
}

/// Admission control stage.
///
/// Derives the [`ClientId`], spends one token from that client's bucket,
/// and either rejects with `429` or hands the request downstream. Holds no
/// state of its own beyond the shared [`ClientRegistry`] and, when attached,
/// the counters its rejections are reported to.
pub struct RateLimitMiddleware {
    registry: Arc<ClientRegistry>,
    limit: String,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl RateLimitMiddleware {
    /// `limit` is the value advertised in [`LIMIT_HEADER`].
    pub fn new(registry: Arc<ClientRegistry>, limit: u32) -> Self {
        Self {
            registry,
            limit: limit.to_string(),
            metrics: None,
        }
    }

    /// Reports every rejection to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponse {
        let client = ClientId::from_request(ctx.request());
        let admitted = self.registry.get_or_create(client.as_str()).allow();
        let limit = self.limit.clone();

        if !admitted {
            tracing::debug!(client = %client, path = %ctx.request().path(), "rate limit exceeded");
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited();
            }
            return Box::pin(async move {
                Response::json(StatusCode::TOO_MANY_REQUESTS, &RateLimitRejection::new())
                    .header(LIMIT_HEADER, limit)
                    .header(REMAINING_HEADER, "0")
            });
        }

        ctx.extensions_mut().insert(client);
        Box::pin(async move {
            let mut response = next.run(ctx).await;
            response.set_header(LIMIT_HEADER, limit);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::from_middleware;
    use crate::middleware::testing::{counting_terminal, run_chain};
    use crate::{Method, Request};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn from_peer(ip: &str) -> Context {
        let addr = format!("{ip}:1234").parse().unwrap();
        Context::new(Request::new(Method::Get, "/test").with_peer_addr(addr))
    }

    fn stage(rate: u32, burst: u32) -> crate::middleware::MiddlewareHandler {
        let registry = Arc::new(ClientRegistry::new(rate as f64, burst as f64));
        from_middleware(Arc::new(RateLimitMiddleware::new(registry, rate)))
    }

    #[tokio::test(start_paused = true)]
    async fn twenty_first_request_is_rejected() {
        let (terminal, calls) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![stage(10, 20), terminal];

        for i in 0..20 {
            let res = run_chain(&chain, from_peer("127.0.0.1")).await;
            assert_eq!(res.status(), StatusCode::OK, "request {i}");
            assert_eq!(res.headers().get("x-ratelimit-limit"), Some("10"));
            assert!(res.headers().get("x-ratelimit-remaining").is_none());
        }

        let res = run_chain(&chain, from_peer("127.0.0.1")).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get("x-ratelimit-limit"), Some("10"));
        assert_eq!(res.headers().get("x-ratelimit-remaining"), Some("0"));
        let body: serde_json::Value = serde_json::from_slice(res.bytes()).unwrap();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert!(body["message"].as_str().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 20);

        tokio::time::advance(Duration::from_millis(100)).await;
        let res = run_chain(&chain, from_peer("127.0.0.1")).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn different_peers_do_not_share_buckets() {
        let (terminal, _) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![stage(10, 20), terminal];

        for ip in ["192.168.1.1", "192.168.1.2", "192.168.1.3"] {
            for _ in 0..20 {
                let res = run_chain(&chain, from_peer(ip)).await;
                assert_eq!(res.status(), StatusCode::OK);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_header_overrides_peer_address() {
        let (terminal, _) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![stage(1, 1), terminal];

        let spoofed = |ctx: Context| {
            let req = ctx.into_request().header("X-Forwarded-For", "203.0.113.9");
            Context::new(req)
        };

        // Same peer, different claimed identities: each gets its own bucket.
        let first = run_chain(&chain, from_peer("10.0.0.1")).await;
        let second = run_chain(&chain, spoofed(from_peer("10.0.0.1"))).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        let third = run_chain(&chain, spoofed(from_peer("10.0.0.2"))).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_reported_to_metrics() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let registry = Arc::new(ClientRegistry::new(1.0, 2.0));
        let limiter = RateLimitMiddleware::new(registry, 1).with_metrics(Arc::clone(&metrics));
        let (terminal, _) = counting_terminal(|_| Response::new(StatusCode::TOO_MANY_REQUESTS));
        let chain = vec![from_middleware(Arc::new(limiter)), terminal];

        // Two admitted requests whose downstream answers 429, then one real rejection.
        for _ in 0..3 {
            let res = run_chain(&chain, from_peer("127.0.0.1")).await;
            assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        assert_eq!(metrics.snapshot().rate_limited, 1);
    }

    #[tokio::test]
    async fn admitted_request_carries_client_id_downstream() {
        let (terminal, _) = counting_terminal(|ctx| {
            let client = ctx.extensions().get::<ClientId>().map(|c| c.as_str().to_owned());
            Response::new(StatusCode::OK).body(client.unwrap_or_default())
        });
        let chain = vec![stage(10, 20), terminal];

        let res = run_chain(&chain, from_peer("198.51.100.4")).await;
        assert_eq!(res.bytes().as_ref(), b"198.51.100.4");
    }
}
