use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use magsag_protocol::{GateResult, RateDecision, RateLimiter};
use parking_lot::Mutex;
use tracing::debug;

use crate::validate;

/// Continuous token bucket: refills `rate` tokens per second up to `rate`.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(rate: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(rate),
            rate: f64::from(rate),
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: u32, now: Instant) {
        let rate = f64::from(rate);
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.rate = rate;
        self.tokens = (self.tokens + elapsed * rate).min(rate);
        self.last_refill = self.last_refill.max(now);
    }

    fn try_take(&mut self) -> RateDecision {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::granted();
        }
        let missing = 1.0 - self.tokens;
        let retry_after_ms = (missing * 1_000.0 / self.rate).ceil() as u64;
        RateDecision::rejected(retry_after_ms.max(1))
    }
}

/// Token buckets in process memory, one per key.
///
/// Decisions are linearizable within one process only: two processes each
/// running this limiter each grant the full budget. Use
/// [`DistributedRateLimiter`](crate::DistributedRateLimiter) when several
/// processes share a budget.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allow_at(&self, key: &str, qps_limit: u32, now: Instant) -> GateResult<RateDecision> {
        validate(key, qps_limit)?;
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::full(qps_limit, now));
        bucket.refill(qps_limit, now);
        Ok(bucket.try_take())
    }

    /// Drop buckets untouched for longer than `max_idle`. Returns how many.
    fn evict_idle_at(&self, now: Instant, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= max_idle);
        before - buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(&self, key: &str, qps_limit: u32) -> GateResult<RateDecision> {
        let decision = self.allow_at(key, qps_limit, Instant::now())?;
        if !decision.granted {
            debug!(key, retry_after_ms = ?decision.retry_after_ms, "in-memory bucket empty");
        }
        Ok(decision)
    }

    async fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted = self.evict_idle_at(Instant::now(), max_idle);
        if evicted > 0 {
            debug!(evicted, "dropped idle buckets");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use magsag_protocol::GateError;

    use super::*;

    #[test]
    fn burst_is_capped_at_qps_limit() -> Result<()> {
        let limiter = InMemoryRateLimiter::new();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.allow_at("key:a", 10, now)?.granted);
        }
        let rejected = limiter.allow_at("key:a", 10, now)?;
        assert!(!rejected.granted);
        assert_eq!(rejected.retry_after_ms, Some(100));
        Ok(())
    }

    #[test]
    fn tokens_refill_continuously() -> Result<()> {
        let limiter = InMemoryRateLimiter::new();
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.allow_at("key:a", 5, start)?.granted);
        }
        assert!(!limiter.allow_at("key:a", 5, start)?.granted);

        // 250ms at 5 qps refills 1.25 tokens
        let later = start + Duration::from_millis(250);
        assert!(limiter.allow_at("key:a", 5, later)?.granted);
        assert!(!limiter.allow_at("key:a", 5, later)?.granted);

        let much_later = start + Duration::from_secs(10);
        for _ in 0..5 {
            assert!(limiter.allow_at("key:a", 5, much_later)?.granted);
        }
        assert!(!limiter.allow_at("key:a", 5, much_later)?.granted);
        Ok(())
    }

    #[test]
    fn keys_have_independent_buckets() -> Result<()> {
        let limiter = InMemoryRateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow_at("key:a", 1, now)?.granted);
        assert!(!limiter.allow_at("key:a", 1, now)?.granted);
        assert!(limiter.allow_at("key:b", 1, now)?.granted);
        assert_eq!(limiter.tracked_keys(), 2);
        Ok(())
    }

    #[test]
    fn evicts_idle_buckets() -> Result<()> {
        let limiter = InMemoryRateLimiter::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(120);
        limiter.allow_at("key:old", 1, start)?;
        limiter.allow_at("key:new", 1, later)?;
        assert_eq!(limiter.evict_idle_at(later, Duration::from_secs(60)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_burst_grants_exactly_the_limit() -> Result<()> {
        let limiter = Arc::new(InMemoryRateLimiter::new());
        let now = Instant::now();
        let handles = (0..11)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow_at("key:burst", 10, now) })
            })
            .collect::<Vec<_>>();

        let mut granted = 0;
        for handle in futures_util::future::join_all(handles).await {
            if handle??.granted {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        Ok(())
    }

    #[tokio::test]
    async fn eviction_through_the_limiter_port() -> Result<()> {
        let limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new());
        limiter.allow("key:a", 5).await?;
        assert_eq!(limiter.evict_idle(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.evict_idle(Duration::from_millis(5)).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_key_is_an_error_not_a_rejection() {
        let limiter = InMemoryRateLimiter::new();
        let err = limiter.allow("", 10).await.unwrap_err();
        assert!(matches!(err, GateError::InvalidRateLimitKey(_)));
    }
}
