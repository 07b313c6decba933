//! Backend forwarding.
//!
//! The terminal stage of the pipeline hands each admitted, uncached request
//! to a [`Forwarder`]. [`HttpForwarder`] is the production implementation;
//! tests substitute their own.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::{
    Request, Response, StatusCode,
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
    ratelimit::ClientId,
};

mod client;
mod codec;
mod upstream;

pub use client::HttpForwarder;
pub use upstream::Upstream;

/// Errors produced while forwarding a request to the backend.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid backend URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("invalid chunked encoding in backend response")]
    InvalidChunk,
}

/// JSON body sent to the client when forwarding fails.
#[derive(Debug, Serialize)]
pub struct ProxyFailure {
    pub error: &'static str,
    pub message: &'static str,
}

impl ProxyError {
    /// Client-facing response for this failure: `504` for timeouts, `502` otherwise.
    pub fn to_response(&self) -> Response {
        match self {
            Self::Timeout(_) => Response::json(
                StatusCode::GATEWAY_TIMEOUT,
                &ProxyFailure {
                    error: "backend_timeout",
                    message: "The backend service did not respond in time",
                },
            ),
            _ => Response::json(
                StatusCode::BAD_GATEWAY,
                &ProxyFailure {
                    error: "backend_unavailable",
                    message: "The backend service is currently unavailable",
                },
            ),
        }
    }
}

/// Future returned by [`Forwarder::forward`].
pub type ForwardFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, ProxyError>> + Send + 'a>>;

/// Sends a request to the backend and returns its complete response.
pub trait Forwarder: Send + Sync {
    fn forward(&self, request: Request) -> ForwardFuture<'_>;
}

/// Terminal stage: forwards the request and converts failures to 502/504.
///
/// Failures are not retried.
pub struct ForwardMiddleware {
    forwarder: Arc<dyn Forwarder>,
}

impl ForwardMiddleware {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }
}

impl Middleware for ForwardMiddleware {
    fn handle(&self, ctx: Context, _next: Next) -> BoxResponse {
        let forwarder = Arc::clone(&self.forwarder);

        Box::pin(async move {
            let client = ctx
                .extensions()
                .get::<ClientId>()
                .cloned()
                .unwrap_or_else(|| ClientId::from_request(ctx.request()));
            let request = ctx.into_request();
            let method = request.method().clone();
            let path = request.path().to_owned();

            match forwarder.forward(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(client = %client, method = %method, path = %path, error = %e, "forwarding failed");
                    e.to_response()
                }
            }
        })
    }
}
