//! Per-agent token-bucket rate limiting.
//!
//! Each agent name gets a bucket with a configurable burst capacity and
//! refill rate.  Denied sends are dropped silently by the router and only
//! visible in the stats.  A no-op limiter is selectable via config or the
//! rate-limit disable environment flag.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Config + stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket can hold.
    pub burst: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            burst: 10.0,
            refill_per_sec: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub denied: u64,
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

/// Token-bucket limiter keyed by agent name, or a pass-through no-op.
pub enum RateLimiter {
    TokenBucket {
        config: RateLimitConfig,
        state: Mutex<LimiterState>,
    },
    Noop,
}

#[derive(Debug, Default)]
pub struct LimiterState {
    buckets: HashMap<String, Bucket>,
    stats: RateLimitStats,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter::TokenBucket {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn noop() -> Self {
        RateLimiter::Noop
    }

    /// Take one token for `name`; `false` means the send is dropped.
    pub fn try_acquire(&self, name: &str) -> bool {
        let RateLimiter::TokenBucket { config, state } = self else {
            return true;
        };
        let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        let bucket = state.buckets.entry(name.to_owned()).or_insert(Bucket {
            tokens: config.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * config.refill_per_sec).min(config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            state.stats.allowed += 1;
            true
        } else {
            state.stats.denied += 1;
            false
        }
    }

    /// Refill `name`'s bucket to burst capacity.
    pub fn reset(&self, name: &str) {
        if let RateLimiter::TokenBucket { state, .. } = self {
            let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.buckets.remove(name);
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        match self {
            RateLimiter::TokenBucket { state, .. } => state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .stats
                .clone(),
            RateLimiter::Noop => RateLimitStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_honored_then_denied() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 3.0,
            refill_per_sec: 0.0,
        });
        assert!(limiter.try_acquire("A"));
        assert!(limiter.try_acquire("A"));
        assert!(limiter.try_acquire("A"));
        assert!(!limiter.try_acquire("A"));

        // Another agent has its own bucket.
        assert!(limiter.try_acquire("B"));

        let stats = limiter.stats();
        assert_eq!(stats.allowed, 4);
        assert_eq!(stats.denied, 1);
    }

    #[test]
    fn reset_refills_the_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst: 1.0,
            refill_per_sec: 0.0,
        });
        assert!(limiter.try_acquire("A"));
        assert!(!limiter.try_acquire("A"));
        limiter.reset("A");
        assert!(limiter.try_acquire("A"));
    }

    #[test]
    fn noop_always_allows() {
        let limiter = RateLimiter::noop();
        for _ in 0..1000 {
            assert!(limiter.try_acquire("A"));
        }
        assert_eq!(limiter.stats(), RateLimitStats::default());
    }
}
