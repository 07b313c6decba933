use crate::{
    Method, Response, StatusCode,
    config::CorsConfig,
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

/// CORS middleware: answers preflight requests and decorates proxied
/// responses with `Access-Control-*` headers.
///
/// # Behavior
///
/// - With the wildcard origin `"*"` in the allow-list, every response
///   carries `Access-Control-Allow-Origin: *`, whether or not the request
///   sent an `Origin`.
/// - Otherwise a listed `Origin` is echoed back along with `Vary: Origin`;
///   an unlisted or absent origin gets no CORS headers.
/// - An `OPTIONS` request with an `Origin` is a preflight. It is answered
///   here with `204 No Content` and never reaches rate limiting or the
///   backend.
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    methods: String,
    headers: String,
    max_age: String,
}

impl CorsMiddleware {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            methods: config.allowed_methods.join(", "),
            headers: config.allowed_headers.join(", "),
            max_age: config.max_age_secs.to_string(),
        }
    }

    fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    // Value for `Access-Control-Allow-Origin`, or `None` to send no CORS headers.
    fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.is_wildcard() {
            return Some("*".to_owned());
        }
        origin
            .filter(|o| self.allowed_origins.iter().any(|allowed| allowed == o))
            .map(str::to_owned)
    }

    fn decorate(&self, response: &mut Response, allow_origin: &str) {
        response.set_header("Access-Control-Allow-Origin", allow_origin);
        response.set_header("Access-Control-Allow-Methods", self.methods.as_str());
        response.set_header("Access-Control-Allow-Headers", self.headers.as_str());
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new(&CorsConfig::default())
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let origin = ctx.request().headers().get("origin");
        let is_preflight = origin.is_some() && *ctx.request().method() == Method::Options;
        let allow_origin = self.allow_origin(origin);

        if is_preflight {
            let mut response = Response::new(StatusCode::NO_CONTENT);
            if let Some(allow) = &allow_origin {
                self.decorate(&mut response, allow);
                response.set_header("Access-Control-Max-Age", self.max_age.as_str());
            }
            return Box::pin(async move { response });
        }

        let Some(allow) = allow_origin else {
            return Box::pin(next.run(ctx));
        };

        // Precompute the decoration so the future does not borrow `self`.
        let mut template = Response::new(StatusCode::OK);
        self.decorate(&mut template, &allow);
        let (_, cors_headers, _) = template.into_parts();

        Box::pin(async move {
            let mut response = next.run(ctx).await;
            for (name, value) in cors_headers.iter() {
                if name.eq_ignore_ascii_case("vary") {
                    response.add_header(name, value);
                } else {
                    response.set_header(name, value);
                }
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::middleware::from_middleware;
    use crate::middleware::testing::{counting_terminal, run_chain};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn restricted() -> CorsConfig {
        CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_owned()],
            ..CorsConfig::default()
        }
    }

    #[tokio::test]
    async fn wildcard_decorates_every_response() {
        let (terminal, _) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![from_middleware(Arc::new(CorsMiddleware::default())), terminal];

        let res = run_chain(&chain, Context::new(Request::new(Method::Get, "/"))).await;
        assert_eq!(res.headers().get("access-control-allow-origin"), Some("*"));
        assert_eq!(
            res.headers().get("access-control-allow-methods"),
            Some("GET, POST, PUT, DELETE, OPTIONS")
        );
        assert_eq!(
            res.headers().get("access-control-allow-headers"),
            Some("Content-Type, Authorization")
        );
        assert!(res.headers().get("vary").is_none());
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let (terminal, calls) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![from_middleware(Arc::new(CorsMiddleware::default())), terminal];

        let req = Request::new(Method::Options, "/api").header("Origin", "https://x.example");
        let res = run_chain(&chain, Context::new(req)).await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(res.headers().get("access-control-max-age"), Some("3600"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn options_without_origin_is_forwarded() {
        let (terminal, calls) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![from_middleware(Arc::new(CorsMiddleware::default())), terminal];

        let res = run_chain(&chain, Context::new(Request::new(Method::Options, "/api"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listed_origin_is_echoed() {
        let (terminal, _) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![from_middleware(Arc::new(CorsMiddleware::new(&restricted()))), terminal];

        let req = Request::new(Method::Get, "/").header("Origin", "https://app.example.com");
        let res = run_chain(&chain, Context::new(req)).await;
        assert_eq!(
            res.headers().get("access-control-allow-origin"),
            Some("https://app.example.com")
        );
        assert_eq!(res.headers().get("vary"), Some("Origin"));
    }

    #[tokio::test]
    async fn unlisted_origin_gets_no_headers() {
        let (terminal, _) = counting_terminal(|_| Response::new(StatusCode::OK));
        let chain = vec![from_middleware(Arc::new(CorsMiddleware::new(&restricted()))), terminal];

        let req = Request::new(Method::Get, "/").header("Origin", "https://evil.example");
        let res = run_chain(&chain, Context::new(req)).await;
        assert!(res.headers().get("access-control-allow-origin").is_none());
    }
}
