//! # visara-gateway
//!
//! An async HTTP/1.1 gateway that sits in front of a single backend service
//! and applies per-client rate limiting and response caching before
//! forwarding.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use visara_gateway::{Gateway, GatewayConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let server = Server::bind(&config.listen_addr).await?;
//!     let gateway = Arc::new(Gateway::from_config(config)?);
//!     gateway.start();
//!
//!     let handler = Arc::clone(&gateway);
//!     server.run(move |req| handler.handle(req)).await?;
//!     Ok(())
//! }
//! ```

// ── Transport ─────────────────────────────────────────────────────────────────
pub mod http;
pub mod server;

// ── Pipeline building blocks ──────────────────────────────────────────────────
pub mod context;
pub mod middleware;
pub mod router;

// ── Gateway policies ──────────────────────────────────────────────────────────
pub mod background;
pub mod cache;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod security;

// ── Assembly ──────────────────────────────────────────────────────────────────
pub mod config;
pub mod pipeline;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, GatewayConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use pipeline::{Gateway, GatewayError};
pub use server::{Server, ServerError};
