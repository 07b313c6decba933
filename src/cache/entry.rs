use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::http::{Headers, Response, StatusCode};

/// Immutable snapshot of a downstream response.
///
/// Never mutated after construction; the cache replaces or deletes whole
/// entries.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    /// Captures a response, timestamped now, valid for `ttl`.
    pub fn new(status: StatusCode, headers: Headers, body: Bytes, ttl: Duration) -> Self {
        Self {
            status,
            headers,
            body,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Time since the entry was stored.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// An entry is expired once strictly more than `ttl` has elapsed.
    pub fn is_expired(&self) -> bool {
        self.age() > self.ttl
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Rebuilds the stored response. The body buffer is shared, not copied.
    pub fn to_response(&self) -> Response {
        Response::from_parts(self.status, self.headers.clone(), self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl: Duration) -> CacheEntry {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        CacheEntry::new(StatusCode::OK, headers, Bytes::from_static(b"payload"), ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_strictly_after_ttl() {
        let e = entry(Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(!e.is_expired(), "exactly ttl old is still fresh");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(e.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn age_tracks_elapsed_time() {
        let e = entry(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(e.age(), Duration::from_secs(12));
    }

    #[test]
    fn to_response_reproduces_parts() {
        let e = entry(Duration::from_secs(1));
        let (status, headers, body) = e.to_response().into_parts();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&headers, e.headers());
        assert_eq!(body, Bytes::from_static(b"payload"));
    }
}
