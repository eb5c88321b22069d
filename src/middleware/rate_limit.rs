//! Token-bucket rate limiting.
//!
//! [`RateLimiter`] is the capability object: build one, share it through an
//! `Arc`, and hand it to [`rate_limit`]. The same limiter may back several
//! routes so they draw from one budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::debug;

use super::{Middleware, Next};
use crate::context::Context;
use crate::error::HandlerError;
use crate::status::Status;

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self { tokens: capacity, last_update: now }
    }

    fn try_acquire(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Bucket count that triggers the first sweep of refilled buckets.
const SWEEP_THRESHOLD: usize = 1024;

struct Buckets {
    map: HashMap<String, TokenBucket>,
    sweep_at: usize,
}

/// Per-key token buckets with a shared refill rate and burst size.
///
/// Buckets that have refilled completely are indistinguishable from new
/// ones, so they are dropped whenever the map doubles past its last sweep.
pub struct RateLimiter {
    per_second: f64,
    burst: f64,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// `per_second` tokens are refilled each second, up to `burst`.
    pub fn new(per_second: u32, burst: u32) -> Self {
        Self {
            per_second: f64::from(per_second),
            burst: f64::from(burst.max(1)),
            buckets: Mutex::new(Buckets { map: HashMap::new(), sweep_at: SWEEP_THRESHOLD }),
        }
    }

    /// Takes one token from `key`'s bucket.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if buckets.map.len() >= buckets.sweep_at && !buckets.map.contains_key(key) {
            self.sweep(&mut buckets, now);
        }
        let bucket = buckets
            .map
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::new(self.burst, now));
        bucket.try_acquire(self.burst, self.per_second, now)
    }

    /// Seconds until one token is available again, rounded up.
    fn retry_after(&self) -> u64 {
        if self.per_second <= 0.0 {
            return 60;
        }
        ((1.0 / self.per_second).ceil() as u64).max(1)
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).map.len()
    }

    fn sweep(&self, buckets: &mut Buckets, now: Instant) {
        let full_after = if self.per_second > 0.0 { self.burst / self.per_second } else { f64::MAX };
        let before = buckets.map.len();
        buckets
            .map
            .retain(|_, b| now.saturating_duration_since(b.last_update).as_secs_f64() < full_after);
        buckets.sweep_at = (buckets.map.len() * 2).max(SWEEP_THRESHOLD);
        debug!(before, after = buckets.map.len(), "rate limit buckets swept");
    }
}

/// Limits requests per tenant, falling back to the peer IP address for
/// requests without a tenant. Over-limit requests fail with `429` and a
/// `Retry-After` header.
pub fn rate_limit(limiter: Arc<RateLimiter>) -> impl Middleware {
    move |ctx: Context, next: Next| {
        let limiter = Arc::clone(&limiter);
        async move {
            let key = match (ctx.tenant_id(), ctx.request().remote_addr()) {
                (Some(t), _) => format!("tenant:{t}"),
                (None, Some(addr)) => format!("ip:{}", addr.ip()),
                (None, None) => "anonymous".to_owned(),
            };
            if !limiter.check(&key) {
                debug!(key = %key, "rate limit exceeded");
                return Err(HandlerError::status(Status::TooManyRequests)
                    .with_header("retry-after", &limiter.retry_after().to_string()));
            }
            next.run(ctx).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn bucket_allows_burst_then_refills() {
        let limiter = RateLimiter::new(2, 3);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0));
        assert!(limiter.check_at("a", t0));
        assert!(limiter.check_at("a", t0));
        assert!(!limiter.check_at("a", t0));
        // Other keys have their own bucket.
        assert!(limiter.check_at("b", t0));
        // Half a second at 2/s refills one token.
        assert!(limiter.check_at("a", t0 + Duration::from_millis(500)));
        assert!(!limiter.check_at("a", t0 + Duration::from_millis(500)));
    }

    #[test]
    fn refilled_buckets_are_evicted_as_keys_churn() {
        let limiter = RateLimiter::new(10, 1);
        let t0 = Instant::now();
        for i in 0..SWEEP_THRESHOLD {
            assert!(limiter.check_at(&format!("ip:10.0.{}.{}", i / 256, i % 256), t0));
        }
        assert_eq!(limiter.tracked(), SWEEP_THRESHOLD);

        // A second later every earlier bucket is full again and gets dropped.
        let t1 = t0 + Duration::from_secs(1);
        assert!(limiter.check_at("ip:192.0.2.1", t1));
        assert_eq!(limiter.tracked(), 1);

        for i in 0..4 * SWEEP_THRESHOLD {
            limiter.check_at(&format!("ip:198.51.{}.{}", i / 256, i % 256), t1 + Duration::from_secs(i as u64));
        }
        assert!(limiter.tracked() <= SWEEP_THRESHOLD);
    }

    #[test]
    fn drained_buckets_survive_a_sweep() {
        let limiter = RateLimiter::new(1, 1);
        let t0 = Instant::now();
        for i in 0..SWEEP_THRESHOLD - 1 {
            limiter.check_at(&format!("k{i}"), t0);
        }
        let t1 = t0 + Duration::from_secs(10);
        assert!(limiter.check_at("busy", t1));

        assert!(limiter.check_at("new", t1));
        assert_eq!(limiter.tracked(), 2);
        // "busy" is still empty, so it must not come back as a fresh bucket.
        assert!(!limiter.check_at("busy", t1));
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        assert_eq!(RateLimiter::new(10, 1).retry_after(), 1);
        assert_eq!(RateLimiter::new(0, 1).retry_after(), 60);
    }
}
