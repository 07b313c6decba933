//! Per-client rate limiting.
//!
//! - [`TokenBucket`]: the admission primitive.
//! - [`ClientRegistry`]: client id → bucket, with idle eviction.
//! - [`RateLimitMiddleware`]: the pipeline stage that admits or rejects.
//! - [`ClientId`]: how a request is attributed to a client.

use std::fmt;

use crate::Request;

mod bucket;
mod middleware;
mod registry;

pub use bucket::TokenBucket;
pub use middleware::{LIMIT_HEADER, REMAINING_HEADER, RateLimitMiddleware, RateLimitRejection};
pub use registry::ClientRegistry;

/// Header whose value, when present, is used verbatim as the client identity.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Identity a request is rate limited under.
///
/// Taken from the `X-Forwarded-For` request header when present, otherwise
/// the IP of the transport peer. The header is supplied by the client, so a
/// client talking to the gateway directly can pick any identity it likes and
/// sidestep its own limit. Deploy behind a proxy that overwrites the header,
/// or accept that limits are advisory for direct clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Identity used when neither the header nor the peer address is known.
    pub const UNKNOWN: &'static str = "unknown";

    /// Derives the identity of the client that sent `request`.
    pub fn from_request(request: &Request) -> Self {
        if let Some(forwarded) = request
            .headers()
            .get(FORWARDED_FOR_HEADER)
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Self(forwarded.to_owned());
        }

        match request.peer_addr() {
            Some(addr) => Self(addr.ip().to_string()),
            None => Self(Self::UNKNOWN.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
