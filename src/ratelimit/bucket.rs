//! Token bucket admission primitive.

use parking_lot::Mutex;
use tokio::time::Instant;

/// A lazily refilled token bucket.
///
/// Holds up to `capacity` tokens and regains `refill_rate` tokens per second.
/// There is no timer per bucket: each [`allow`](Self::allow) call first
/// credits the time elapsed since the previous call, then tries to spend one
/// token. The refill and the spend happen under one bucket-local lock, so
/// concurrent callers can never both spend the same token.
///
/// # Examples
///
/// ```
/// use visara_gateway::ratelimit::TokenBucket;
///
/// let bucket = TokenBucket::new(10.0, 2.0);
/// assert!(bucket.allow());
/// assert!(bucket.allow());
/// assert!(!bucket.allow());
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    // Invariant: 0.0 <= tokens <= capacity.
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// `refill_rate` is in tokens per second; `capacity` is the burst size.
    pub fn new(refill_rate: f64, capacity: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Spends one token if one is available.
    ///
    /// Returns `true` when the request is admitted.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.spend(&mut state, now)
    }

    fn spend(&self, state: &mut BucketState, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        // Never moves backwards, so an interval is credited at most once.
        state.last_refill = state.last_refill.max(now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns the token count as of the last [`allow`](Self::allow) call,
    /// without crediting any elapsed time.
    pub fn tokens(&self) -> f64 {
        self.state.lock().tokens
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
