//! # Synthesis Rate Limiting
//!
//! Token-bucket admission control bounding how many synthesis attempts each
//! namespace may start per hour. A bucket holds up to `max_per_hour` permits
//! and refills continuously at `max_per_hour / 3600` permits per second.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, SynthesisError};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Token bucket for a single namespace
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Create a full bucket. `refill_rate` is in tokens per second.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// Add tokens for the time elapsed since the last refill, capped at capacity.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        // A clock that steps backwards adds nothing.
        let elapsed_ms = (now - self.last_refill).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let elapsed = elapsed_ms as f64 / 1000.0;

        self.tokens = (self.tokens + elapsed * self.refill_rate).clamp(0.0, self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Refill, then take `tokens` if that many are available.
    pub fn try_consume(&mut self, tokens: f64, now: DateTime<Utc>) -> bool {
        self.refill(now);

        if self.tokens < tokens {
            return false;
        }

        self.tokens = (self.tokens - tokens).max(0.0);
        true
    }

    /// Time until `tokens` permits will be available.
    pub fn time_until(&mut self, tokens: f64, now: DateTime<Utc>) -> Duration {
        self.refill(now);

        if self.tokens >= tokens {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }

        let tokens_needed = tokens - self.tokens;
        Duration::from_secs_f64(tokens_needed / self.refill_rate)
    }

    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Snapshot of a namespace bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub available_tokens: f64,
    pub capacity: f64,
}

/// Rate limiter for controlling synthesis frequency per namespace
pub struct RateLimiter {
    max_per_hour: u32,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a new rate limiter backed by the system clock
    pub fn new(max_per_hour: u32) -> Result<Self> {
        Self::with_clock(max_per_hour, Arc::new(SystemClock))
    }

    /// Create a rate limiter reading time from `clock`
    pub fn with_clock(max_per_hour: u32, clock: SharedClock) -> Result<Self> {
        if max_per_hour == 0 {
            return Err(SynthesisError::InvalidArgument(
                "synthesis rate limit per hour cannot be zero".to_string(),
            ));
        }

        Ok(Self {
            max_per_hour,
            buckets: DashMap::new(),
            clock,
        })
    }

    #[must_use]
    pub fn max_per_hour(&self) -> u32 {
        self.max_per_hour
    }

    fn bucket(&self, namespace: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(existing) = self.buckets.get(namespace) {
            return Arc::clone(existing.value());
        }

        // Creation happens under the shard write lock, so racing callers
        // all receive the same bucket.
        let entry = self
            .buckets
            .entry(namespace.to_string())
            .or_insert_with(|| {
                let capacity = f64::from(self.max_per_hour);
                debug!(namespace, capacity, "Creating synthesis token bucket");
                Arc::new(Mutex::new(TokenBucket::new(
                    capacity,
                    capacity / SECONDS_PER_HOUR,
                    self.clock.now(),
                )))
            });
        Arc::clone(entry.value())
    }

    /// Check if a synthesis is allowed and consume a token if so
    pub fn check_and_consume(&self, namespace: &str) -> Result<()> {
        let bucket = self.bucket(namespace);
        let mut bucket = bucket.lock();
        let now = self.clock.now();

        if bucket.try_consume(1.0, now) {
            debug!(
                namespace,
                remaining_tokens = bucket.tokens(),
                "Synthesis rate limit check passed"
            );
            return Ok(());
        }

        let retry_after = bucket.time_until(1.0, now);
        info!(
            namespace,
            limit = self.max_per_hour,
            available_tokens = bucket.tokens(),
            retry_after_secs = retry_after.as_secs_f64(),
            "Synthesis rate limit exceeded"
        );

        Err(SynthesisError::AdmissionDenied {
            namespace: namespace.to_string(),
            limit: self.max_per_hour,
            retry_after,
        })
    }

    /// Current bucket state for a namespace, refilled to now. Consumes nothing.
    #[must_use]
    pub fn namespace_stats(&self, namespace: &str) -> Option<BucketStats> {
        let bucket = Arc::clone(self.buckets.get(namespace)?.value());
        let mut bucket = bucket.lock();
        bucket.refill(self.clock.now());

        Some(BucketStats {
            available_tokens: bucket.tokens(),
            capacity: bucket.capacity(),
        })
    }

    /// Aggregate counters across namespaces
    #[must_use]
    pub fn statistics(&self) -> HashMap<String, u64> {
        let now = self.clock.now();
        let buckets: Vec<_> = self
            .buckets
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let exhausted = buckets
            .iter()
            .filter(|bucket| {
                let mut bucket = bucket.lock();
                bucket.refill(now);
                bucket.tokens() < 1.0
            })
            .count() as u64;

        let mut stats = HashMap::new();
        stats.insert("active_namespaces".to_string(), buckets.len() as u64);
        stats.insert("rate_limited_namespaces".to_string(), exhausted);
        stats
    }

    /// Clear all rate limit state
    pub fn reset(&self) {
        let before = self.buckets.len();
        self.buckets.clear();
        info!("Reset rate limit state for {} namespaces", before);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn limiter(max_per_hour: u32) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::with_clock(max_per_hour, Arc::new(clock.clone())).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(matches!(
            RateLimiter::new(0),
            Err(SynthesisError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_capacity_then_denied() {
        let (limiter, _clock) = limiter(10);

        for _ in 0..10 {
            limiter.check_and_consume("team-a").unwrap();
        }

        let err = limiter.check_and_consume("team-a").unwrap_err();
        match err {
            SynthesisError::AdmissionDenied {
                namespace,
                limit,
                retry_after,
            } => {
                assert_eq!(namespace, "team-a");
                assert_eq!(limit, 10);
                // One token at 10/3600 per second takes 360 seconds.
                assert!((retry_after.as_secs_f64() - 360.0).abs() < 1.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let (limiter, _clock) = limiter(1);

        limiter.check_and_consume("team-a").unwrap();
        assert!(limiter.check_and_consume("team-a").is_err());
        assert!(limiter.check_and_consume("team-b").is_ok());
    }

    #[test]
    fn test_refill_over_time() {
        let (limiter, clock) = limiter(10);
        for _ in 0..10 {
            limiter.check_and_consume("team-a").unwrap();
        }
        assert!(limiter.check_and_consume("team-a").is_err());

        clock.advance(ChronoDuration::seconds(361));
        assert!(limiter.check_and_consume("team-a").is_ok());
        assert!(limiter.check_and_consume("team-a").is_err());
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let (limiter, clock) = limiter(5);
        limiter.check_and_consume("team-a").unwrap();

        clock.advance(ChronoDuration::days(3));
        let stats = limiter.namespace_stats("team-a").unwrap();
        assert!((stats.available_tokens - 5.0).abs() < f64::EPSILON);
        assert!((stats.capacity - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_do_not_consume() {
        let (limiter, _clock) = limiter(3);
        assert!(limiter.namespace_stats("team-a").is_none());

        limiter.check_and_consume("team-a").unwrap();
        let first = limiter.namespace_stats("team-a").unwrap();
        let second = limiter.namespace_stats("team-a").unwrap();
        assert!((first.available_tokens - 2.0).abs() < 1e-9);
        assert!((second.available_tokens - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_backwards_clock_keeps_tokens_in_range() {
        let (limiter, clock) = limiter(2);
        limiter.check_and_consume("team-a").unwrap();

        clock.advance(ChronoDuration::seconds(-600));
        let stats = limiter.namespace_stats("team-a").unwrap();
        assert!(stats.available_tokens >= 0.0);
        assert!(stats.available_tokens <= stats.capacity);
    }

    #[test]
    fn test_tokens_stay_clamped_for_mixed_sequences() {
        let (limiter, clock) = limiter(4);
        for step in 0..200_i64 {
            let _ = limiter.check_and_consume("team-a");
            clock.advance(ChronoDuration::seconds((step * 37) % 1500));
            let stats = limiter.namespace_stats("team-a").unwrap();
            assert!((0.0..=stats.capacity).contains(&stats.available_tokens));
        }
    }

    #[test]
    fn test_reset_restores_full_bucket() {
        let (limiter, _clock) = limiter(1);
        limiter.check_and_consume("team-a").unwrap();
        assert!(limiter.check_and_consume("team-a").is_err());

        limiter.reset();
        assert!(limiter.namespace_stats("team-a").is_none());
        assert!(limiter.check_and_consume("team-a").is_ok());
    }

    #[test]
    fn test_statistics_counts_exhausted_namespaces() {
        let (limiter, _clock) = limiter(1);
        limiter.check_and_consume("team-a").unwrap();
        limiter.check_and_consume("team-b").unwrap();
        let _ = limiter.namespace_stats("team-c");

        let stats = limiter.statistics();
        assert_eq!(stats["active_namespaces"], 2);
        assert_eq!(stats["rate_limited_namespaces"], 2);
    }
}
