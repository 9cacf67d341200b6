//! Token bucket implementation.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A per-client token bucket with lazy, fixed-rate refill.
///
/// Tokens are replenished on access rather than by a timer: each admission
/// check first credits one token per whole `refill_rate` elapsed since the
/// last refill, then consumes a token if one is available. Refill never
/// raises the count above `max_tokens`, but the initial seed may start above
/// it, so a fresh bucket can serve a burst larger than steady state allows.
///
/// All mutable state sits behind the bucket's own mutex, so concurrent
/// checks for the same client serialize correctly.
pub struct TokenBucket {
    /// Ceiling the refill never exceeds.
    max_tokens: u64,
    /// Wall-clock cost of one token.
    refill_rate: Duration,
    /// Mutable state, guarded by the bucket's own lock.
    state: Mutex<BucketState>,
}

/// The mutable portion of a bucket.
#[derive(Debug, Clone, Copy)]
struct BucketState {
    /// Current token count.
    tokens: u64,
    /// When refill arithmetic was last applied.
    last_refill: Instant,
    /// When a token was last consumed. `None` until the first allowed
    /// request; denials never touch it.
    last_used: Option<Instant>,
}

/// Point-in-time view of a bucket's mutable state, taken without blocking.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketSnapshot {
    pub(crate) tokens: u64,
    pub(crate) last_used: Option<Instant>,
}

impl TokenBucket {
    /// Create a new bucket seeded with `initial_tokens`.
    ///
    /// The seed is taken as-is: it may exceed `max_tokens`, in which case the
    /// surplus is spendable but never restored once consumed.
    pub fn new(initial_tokens: u64, max_tokens: u64, refill_rate: Duration, now: Instant) -> Self {
        Self {
            max_tokens,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: initial_tokens,
                last_refill: now,
                last_used: None,
            }),
        }
    }

    /// Refill lazily, then consume one token if available.
    ///
    /// Returns `true` if the request is admitted. Runs atomically with
    /// respect to concurrent calls on the same bucket.
    ///
    /// Refill credits `floor(elapsed / refill_rate)` whole tokens. When that
    /// is zero, `last_refill` is left untouched so partial progress toward
    /// the next token keeps accumulating across calls.
    pub fn is_request_allowed(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill);
        let tokens_to_add = self.whole_tokens(elapsed);
        if tokens_to_add > 0 {
            state.tokens = state
                .tokens
                .saturating_add(tokens_to_add)
                .min(self.max_tokens);
            state.last_refill = now;
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            state.last_used = Some(now);
            true
        } else {
            false
        }
    }

    /// Number of whole tokens earned over `elapsed`.
    fn whole_tokens(&self, elapsed: Duration) -> u64 {
        if self.refill_rate.is_zero() {
            return 0;
        }
        u64::try_from(elapsed.as_nanos() / self.refill_rate.as_nanos()).unwrap_or(u64::MAX)
    }

    /// The refill ceiling.
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// The wall-clock cost of one token.
    pub fn refill_rate(&self) -> Duration {
        self.refill_rate
    }

    /// Current token count, as of the last admission check.
    pub fn tokens(&self) -> u64 {
        self.state.lock().tokens
    }

    /// Snapshot `tokens` and `last_used` without blocking.
    ///
    /// Returns `None` when the bucket's lock is held, which means an
    /// admission check is running right now and the bucket is in active use.
    pub(crate) fn try_snapshot(&self) -> Option<BucketSnapshot> {
        self.state.try_lock().map(|state| BucketSnapshot {
            tokens: state.tokens,
            last_used: state.last_used,
        })
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("TokenBucket");
        s.field("max_tokens", &self.max_tokens)
            .field("refill_rate", &self.refill_rate);
        if let Some(state) = self.state.try_lock() {
            s.field("tokens", &state.tokens);
        }
        s.finish()
    }
}
