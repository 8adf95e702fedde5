//! Token bucket rate limiter for provider bindings.
//!
//! Each (provider, chain) binding owns one bucket. `acquire` never blocks:
//! it either takes a token or reports how long until the next one. Tokens
//! accumulate fractionally from elapsed wall-clock time, capped at the
//! burst size. No cross-process state.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::FetchError;

/// Rate limit configuration for one provider binding.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Sustained request allowance per minute.
    pub tokens_per_minute: u32,
    /// Maximum tokens accumulated while idle.
    pub burst_size: u32,
}

/// Token bucket state.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate_per_sec: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.burst_size as f64,
            last_refill: Instant::now(),
            rate_per_sec: config.tokens_per_minute as f64 / 60.0,
            capacity: config.burst_size as f64,
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Estimated wait until a full token is available.
    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let needed = 1.0 - self.tokens;
            Duration::from_secs_f64(needed / self.rate_per_sec)
        }
    }
}

/// Non-blocking per-binding token bucket.
pub struct RateLimiter {
    name: String,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            bucket: Mutex::new(TokenBucket::new(&config)),
        }
    }

    /// Lock the bucket, recovering from poison if necessary. Slightly
    /// incorrect rate limiting beats panicking.
    fn lock_bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter '{}' mutex was poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }

    /// Take one token, or report the estimated wait for the next one.
    ///
    /// Never blocks.
    pub fn acquire(&self) -> Result<(), FetchError> {
        let mut bucket = self.lock_bucket();

        if bucket.try_acquire() {
            debug!("rate limiter '{}': token acquired, {:.2} left", self.name, bucket.tokens);
            Ok(())
        } else {
            let retry_after = bucket.time_until_available();
            Err(FetchError::RateLimited {
                provider: self.name.clone(),
                retry_after_ms: retry_after.as_millis() as u64,
            })
        }
    }

    /// Tokens currently available (after a lazy refill).
    pub fn remaining_tokens(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        bucket.refill();
        bucket.tokens
    }

    /// Restore the bucket to its full burst capacity.
    pub fn reset(&self) {
        let mut bucket = self.lock_bucket();
        bucket.tokens = bucket.capacity;
        bucket.last_refill = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tokens_per_minute: u32, burst_size: u32) -> RateLimitConfig {
        RateLimitConfig {
            tokens_per_minute,
            burst_size,
        }
    }

    #[test]
    fn test_burst_exactly_consumed() {
        let limiter = RateLimiter::new("SINA", config(60, 5));

        for _ in 0..5 {
            assert!(limiter.acquire().is_ok());
        }

        let err = limiter.acquire().unwrap_err();
        match err {
            FetchError::RateLimited { provider, retry_after_ms } => {
                assert_eq!(provider, "SINA");
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_refill_grants_exactly_one_token() {
        let limiter = RateLimiter::new("SINA", config(60, 2));

        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_err());

        // Simulate exactly one refill interval of idle time (1s at 60/min).
        limiter.lock_bucket().last_refill = Instant::now() - Duration::from_secs(1);

        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_err());
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let limiter = RateLimiter::new("SINA", config(6000, 3));

        // A long idle period must not accumulate past the burst size.
        limiter.lock_bucket().last_refill = Instant::now() - Duration::from_secs(60);
        assert!((limiter.remaining_tokens() - 3.0).abs() < 0.01);

        for _ in 0..3 {
            assert!(limiter.acquire().is_ok());
        }
        assert!(limiter.acquire().is_err());
    }

    #[test]
    fn test_retry_after_estimate() {
        let limiter = RateLimiter::new("SINA", config(60, 1));
        assert!(limiter.acquire().is_ok());

        match limiter.acquire().unwrap_err() {
            FetchError::RateLimited { retry_after_ms, .. } => {
                // One token per second; the estimate sits just under 1000ms.
                assert!(retry_after_ms > 800);
                assert!(retry_after_ms <= 1000);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_restores_burst() {
        let limiter = RateLimiter::new("SINA", config(60, 2));
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_err());

        limiter.reset();
        assert!(limiter.acquire().is_ok());
    }

    #[test]
    fn test_fractional_accumulation() {
        let limiter = RateLimiter::new("SINA", config(60, 2));
        limiter.lock_bucket().tokens = 0.0;

        // Half an interval accrues half a token - not enough to acquire.
        limiter.lock_bucket().last_refill = Instant::now() - Duration::from_millis(500);
        assert!(limiter.acquire().is_err());

        // The fraction is preserved; another half interval completes it.
        limiter.lock_bucket().last_refill = Instant::now() - Duration::from_millis(520);
        assert!(limiter.acquire().is_ok());
    }
}
