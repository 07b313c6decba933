use std::sync::Arc;

use super::{CacheEntry, ResponseCache, cache_key};
use crate::{
    Response, StatusCode,
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

/// Response header flagging a cacheable request as `HIT` or `MISS`.
pub const CACHE_STATUS_HEADER: &str = "X-Cache";
/// Response header carrying a hit's age in whole seconds.
pub const CACHE_AGE_HEADER: &str = "X-Cache-Age";

/// Response caching stage.
///
/// Non-cacheable requests pass straight through. A cacheable request is
/// answered from a live entry when one exists; otherwise the rest of the
/// chain runs, its response is buffered whole, stored if its status is in
/// `200..400`, and relayed unchanged apart from the `MISS` flag. Error
/// responses are relayed as they are and never stored.
pub struct CacheMiddleware {
    cache: Arc<ResponseCache>,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

fn is_storable(status: StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let request = ctx.request();
        let Some(key) = cache_key(request.method(), request.path(), request.query_string()) else {
            return Box::pin(next.run(ctx));
        };

        if let Some(entry) = self.cache.lookup(&key) {
            return Box::pin(async move {
                let mut response = entry.to_response();
                response.set_header(CACHE_STATUS_HEADER, "HIT");
                response.set_header(CACHE_AGE_HEADER, entry.age().as_secs().to_string());
                response
            });
        }

        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            // Detached so that capture and store finish even if the caller's
            // future is dropped mid-flight.
            let capture = tokio::spawn(async move {
                let response = next.run(ctx).await;
                if is_storable(response.status()) {
                    let entry = CacheEntry::new(
                        response.status(),
                        response.headers().clone(),
                        response.bytes().clone(),
                        cache.ttl(),
                    );
                    cache.store(key, entry);
                }
                response
            });

            match capture.await {
                Ok(mut response) => {
                    response.set_header(CACHE_STATUS_HEADER, "MISS");
                    response
                }
                Err(e) => {
                    tracing::error!(error = %e, "downstream stage panicked");
                    Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;
    use crate::middleware::testing::{counting_terminal, run_chain};
    use crate::middleware::{BoxResponse, MiddlewareHandler, Next, from_middleware};
    use crate::{Method, Request};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn ctx(method: Method, target: &str) -> Context {
        Context::new(Request::new(method, target))
    }

    fn stage(cache: &Arc<ResponseCache>) -> MiddlewareHandler {
        from_middleware(Arc::new(CacheMiddleware::new(Arc::clone(cache))))
    }

    fn echo_target(ctx: &Context) -> Response {
        Response::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .header("Set-Cookie", "a=1")
            .header("Set-Cookie", "b=2")
            .body(ctx.request().target())
    }

    fn without_cache_headers(headers: &Headers) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(CACHE_STATUS_HEADER))
            .filter(|(k, _)| !k.eq_ignore_ascii_case(CACHE_AGE_HEADER))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn miss_then_hit_then_miss_after_ttl() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let (terminal, calls) = counting_terminal(echo_target);
        let chain = vec![stage(&cache), terminal];

        let first = run_chain(&chain, ctx(Method::Get, "/x")).await;
        assert_eq!(first.headers().get("x-cache"), Some("MISS"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(7)).await;
        let second = run_chain(&chain, ctx(Method::Get, "/x")).await;
        assert_eq!(second.headers().get("x-cache"), Some("HIT"));
        assert_eq!(second.headers().get("x-cache-age"), Some("7"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.status(), first.status());
        assert_eq!(second.bytes(), first.bytes());
        assert_eq!(
            without_cache_headers(second.headers()),
            without_cache_headers(first.headers())
        );

        tokio::time::advance(Duration::from_secs(300)).await;
        let third = run_chain(&chain, ctx(Method::Get, "/x")).await;
        assert_eq!(third.headers().get("x-cache"), Some("MISS"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_queries_get_distinct_entries() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let (terminal, calls) = counting_terminal(echo_target);
        let chain = vec![stage(&cache), terminal];

        run_chain(&chain, ctx(Method::Get, "/x?a=1")).await;
        run_chain(&chain, ctx(Method::Get, "/x?a=2")).await;
        assert_eq!(cache.len(), 2);

        let hit = run_chain(&chain, ctx(Method::Get, "/x?a=2")).await;
        assert_eq!(hit.headers().get("x-cache"), Some("HIT"));
        assert_eq!(hit.bytes().as_ref(), b"/x?a=2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn post_is_never_cached_or_flagged() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let (terminal, calls) = counting_terminal(echo_target);
        let chain = vec![stage(&cache), terminal];

        for _ in 0..100 {
            let res = run_chain(&chain, ctx(Method::Post, "/x")).await;
            assert!(res.headers().get("x-cache").is_none());
        }
        assert!(cache.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn error_responses_pass_through_uncached() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let (terminal, calls) = counting_terminal(|_| {
            Response::new(StatusCode::BAD_GATEWAY).body("backend down")
        });
        let chain = vec![stage(&cache), terminal];

        for _ in 0..3 {
            let res = run_chain(&chain, ctx(Method::Get, "/flaky")).await;
            assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
            assert_eq!(res.bytes().as_ref(), b"backend down");
            assert_eq!(res.headers().get("x-cache"), Some("MISS"));
        }
        assert!(cache.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn redirects_are_cached() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let (terminal, _) = counting_terminal(|_| {
            Response::new(StatusCode::FOUND).header("Location", "/elsewhere")
        });
        let chain = vec![stage(&cache), terminal];

        run_chain(&chain, ctx(Method::Get, "/old")).await;
        let hit = run_chain(&chain, ctx(Method::Get, "/old")).await;
        assert_eq!(hit.status(), StatusCode::FOUND);
        assert_eq!(hit.headers().get("location"), Some("/elsewhere"));
        assert_eq!(hit.headers().get("x-cache"), Some("HIT"));
    }

    #[tokio::test]
    async fn miss_is_stored_even_if_the_client_goes_away() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let (e, r) = (Arc::clone(&entered), Arc::clone(&release));
        let slow_backend: MiddlewareHandler = Arc::new(move |_ctx: Context, _next: Next| -> BoxResponse {
            let (entered, release) = (Arc::clone(&e), Arc::clone(&r));
            Box::pin(async move {
                entered.notify_one();
                release.notified().await;
                Response::new(StatusCode::OK).body("slow")
            })
        });
        let chain = vec![stage(&cache), slow_backend];

        let client = tokio::spawn(async move { run_chain(&chain, ctx(Method::Get, "/slow")).await });
        entered.notified().await;
        client.abort();
        assert!(client.await.unwrap_err().is_cancelled());

        release.notify_one();
        let key = cache_key(&Method::Get, "/slow", None).unwrap();
        for _ in 0..100 {
            if cache.lookup(&key).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let entry = cache.lookup(&key).expect("response stored after client cancellation");
        assert_eq!(entry.body().as_ref(), b"slow");
    }
}
