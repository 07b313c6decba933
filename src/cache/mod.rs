//! Response caching.
//!
//! Successful and redirect responses to `GET` requests are kept in memory
//! for a fixed TTL and replayed on later identical requests. Freshness is
//! checked on every lookup, so expiry does not depend on the background
//! sweep; the sweep only reclaims memory for keys nobody asks for again.

mod entry;
mod key;
mod middleware;
mod store;

pub use entry::CacheEntry;
pub use key::{cache_key, is_cacheable};
pub use middleware::{CACHE_AGE_HEADER, CACHE_STATUS_HEADER, CacheMiddleware};
pub use store::ResponseCache;
