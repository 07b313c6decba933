//! Request routing for the gateway's own endpoints.
//!
//! [`Router`] maps exact `(method, path)` pairs to handlers. Anything it does
//! not know is handed to the fallback handler, which in the gateway is the
//! proxy pipeline. Trailing slashes are normalized on both patterns and
//! incoming paths, so `/gateway/health/` and `/gateway/health` are treated
//! as equivalent.
//!
//! A path that is registered under a different method answers
//! `405 Method Not Allowed` with an `Allow` header instead of falling
//! through.

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::middleware::BoxResponse;
use crate::{Method, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
pub type Handler = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> BoxResponse;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxResponse {
        Box::pin((self)(ctx))
    }
}

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// A single registered route binding a method + exact path to a handler.
struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

/// Exact-match router with a catch-all fallback.
///
/// # Examples
///
/// ```rust,no_run
/// use visara_gateway::context::Context;
/// use visara_gateway::router::Router;
/// use visara_gateway::{Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/gateway/health", |_ctx: Context| async { Response::new(StatusCode::OK) });
/// router.fallback(|_ctx: Context| async { Response::new(StatusCode::BAD_GATEWAY) });
/// ```
pub struct Router {
    routes: Vec<Route>,
    fallback: Option<Handler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: None,
        }
    }

    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Sets the handler for requests no route matches. Without one they get `404`.
    pub fn fallback(&mut self, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.fallback = Some(handler);
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            path: normalize(path).to_owned(),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `ctx` to the matching route, the fallback, or an error response.
    pub fn handle(&self, ctx: Context) -> BoxResponse {
        let path = normalize(ctx.request().path()).to_owned();
        let method = ctx.request().method().clone();

        let mut allowed: Vec<&str> = Vec::new();
        for route in self.routes.iter().filter(|r| r.path == path) {
            if route.method == method {
                return (route.handler)(ctx);
            }
            allowed.push(route.method.as_str());
        }

        if !allowed.is_empty() {
            let response = Response::new(StatusCode::METHOD_NOT_ALLOWED).header("Allow", allowed.join(", "));
            return Box::pin(async move { response });
        }

        match &self.fallback {
            Some(fallback) => fallback(ctx),
            None => Box::pin(async { Response::new(StatusCode::NOT_FOUND).body("Not Found") }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;

    fn router() -> Router {
        let mut router = Router::new();
        router.get("/gateway/health", |_ctx: Context| async { Response::new(StatusCode::OK).body("up") });
        router
    }

    fn ctx(method: Method, target: &str) -> Context {
        Context::new(Request::new(method, target))
    }

    #[tokio::test]
    async fn exact_route_matches_with_trailing_slash() {
        let r = router();
        assert_eq!(r.handle(ctx(Method::Get, "/gateway/health")).await.bytes().as_ref(), b"up");
        assert_eq!(r.handle(ctx(Method::Get, "/gateway/health/")).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_method_is_405_with_allow() {
        let res = router().handle(ctx(Method::Post, "/gateway/health")).await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers().get("allow"), Some("GET"));
    }

    #[tokio::test]
    async fn unknown_path_without_fallback_is_404() {
        let res = router().handle(ctx(Method::Get, "/elsewhere")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_path_reaches_fallback() {
        let mut r = router();
        r.fallback(|ctx: Context| async move { Response::new(StatusCode::ACCEPTED).body(ctx.request().target()) });

        let res = r.handle(ctx(Method::Delete, "/api/items/3?hard=true")).await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(res.bytes().as_ref(), b"/api/items/3?hard=true");
        // Prefix of an admin path is not the admin path.
        assert_eq!(r.handle(ctx(Method::Get, "/gateway")).await.status(), StatusCode::ACCEPTED);
    }
}
