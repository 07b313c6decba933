//! Middleware pipeline: composable before/after request handler logic.
//!
//! Every gateway policy is a stage in an ordered chain. Each stage wraps the
//! next one, so it may inspect the request, short-circuit with its own
//! response, or decorate the response coming back.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all stages.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to
//!   advance to the next stage.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable stage function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`LoggerMiddleware`]: request/response logger, outermost stage.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context, ratelimit::ClientId};

/// Boxed future returned by every stage.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run), so a stage can
/// invoke the rest of the chain at most once.
///
/// # Examples
///
/// ```rust,no_run
/// use visara_gateway::{context::Context, middleware::{BoxResponse, Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use visara_gateway::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given chain.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next stage in the chain and returns its response.
    ///
    /// If no stage remains (the chain is exhausted without any stage
    /// producing a response), a `500 Internal Server Error` is returned.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(crate::StatusCode::INTERNAL_SERVER_ERROR)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all gateway stages.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// Implementations are shared across Tokio tasks, so they must be `Send + Sync`
/// and must not hold a lock guard across an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next stage.
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// Logs each request's method, path, status, client, and duration.
///
/// Emits a single `tracing::info!` record after the downstream chain
/// completes. Never short-circuits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();
            let client = ClientId::from_request(ctx.request());

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                client = %client,
                elapsed = ?start.elapsed(),
                bytes = response.bytes().len(),
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for driving a single stage against a scripted downstream.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Terminal stage that counts invocations and answers from `respond`.
    pub(crate) fn counting_terminal<F>(respond: F) -> (MiddlewareHandler, Arc<AtomicUsize>)
    where
        F: Fn(&Context) -> Response + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: MiddlewareHandler = Arc::new(move |ctx: Context, _next: Next| -> BoxResponse {
            counter.fetch_add(1, Ordering::SeqCst);
            let response = respond(&ctx);
            Box::pin(async move { response })
        });
        (handler, calls)
    }

    /// Builds a chain from the given handlers and runs `ctx` through it.
    pub(crate) async fn run_chain(chain: &[MiddlewareHandler], ctx: Context) -> Response {
        Next::new(chain.to_vec().into()).run(ctx).await
    }
}
