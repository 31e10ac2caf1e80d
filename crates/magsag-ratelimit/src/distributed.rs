use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use magsag_protocol::{
    BoxError, EventSink, GateError, GateEvent, GateEventKind, GateResult, NullSink, RateDecision,
    RateLimiter,
};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{WINDOW_MS, validate};

/// Outcome of one atomic check-and-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub granted: bool,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. The limiter fails open on this.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Anything else; surfaced to the caller with the original error kept.
    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),
}

/// Shared consumption log with an atomic check-and-record primitive.
///
/// `try_acquire` must drop records older than `window_ms`, count what is
/// left, and record a new entry only when the count is below `limit`, all as
/// one indivisible step. Each entry's identity is its timestamp plus a per-key
/// sequence number drawn in that same step, so two grants in one millisecond
/// never share an entry.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<Admission, StoreError>;

    /// Drop keys whose every record is older than `window_ms`. Stores whose
    /// keys expire on their own keep the default.
    async fn evict_idle(&self, _window_ms: u64) -> usize {
        0
    }
}

#[async_trait]
impl<S: WindowStore + ?Sized> WindowStore for Arc<S> {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<Admission, StoreError> {
        (**self).try_acquire(key, limit, window_ms).await
    }

    async fn evict_idle(&self, window_ms: u64) -> usize {
        (**self).evict_idle(window_ms).await
    }
}

/// Rate limiter over a shared [`WindowStore`].
///
/// Never grants more than `qps_limit` requests per key in any rolling
/// one-second window, across every process sharing the store. When the store
/// is unreachable the request is admitted, a warning is logged, and a
/// `rate_limiter.degraded` event is emitted for that attempt.
pub struct DistributedRateLimiter<S> {
    store: S,
    events: Arc<dyn EventSink>,
    window_ms: u64,
    degraded: AtomicU64,
}

impl<S: WindowStore> DistributedRateLimiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            events: Arc::new(NullSink),
            window_ms: WINDOW_MS,
            degraded: AtomicU64::new(0),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Number of requests admitted because the store was unreachable.
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn fail_open(&self, key: &str, reason: String) -> RateDecision {
        let total = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;
        let error = GateError::RateLimiterUnavailable(reason.clone());
        warn!(
            key,
            kind = error.kind(),
            %error,
            degraded_total = total,
            "failing open"
        );
        let event = GateEvent::new(GateEventKind::RateLimiterDegraded {
            key: key.to_owned(),
            reason,
        });
        if let Err(error) = self.events.emit(&event).await {
            warn!(%error, "failed to emit rate limiter degradation event");
        }
        RateDecision::granted()
    }
}

#[async_trait]
impl<S: WindowStore> RateLimiter for DistributedRateLimiter<S> {
    #[instrument(skip(self), fields(window_ms = self.window_ms))]
    async fn allow(&self, key: &str, qps_limit: u32) -> GateResult<RateDecision> {
        validate(key, qps_limit)?;
        match self.store.try_acquire(key, qps_limit, self.window_ms).await {
            Ok(admission) => {
                debug!(granted = admission.granted, "window store decided");
                Ok(RateDecision {
                    granted: admission.granted,
                    retry_after_ms: admission.retry_after_ms,
                })
            }
            Err(StoreError::Unavailable(reason)) => Ok(self.fail_open(key, reason).await),
            Err(StoreError::Backend(source)) => Err(GateError::RateLimiterBackend {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Records outlive the window by definition, so `max_idle` only needs to
    /// cover it; the store decides with its own window.
    async fn evict_idle(&self, _max_idle: Duration) -> usize {
        let evicted = self.store.evict_idle(self.window_ms).await;
        if evicted > 0 {
            debug!(evicted, "dropped idle window logs");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use anyhow::Result;
    use futures_util::future::join_all;
    use parking_lot::Mutex;

    use super::*;
    use crate::{LocalWindowStore, ManualClock};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<GateEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: &GateEvent) -> GateResult<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct UnreachableStore;

    #[async_trait]
    impl WindowStore for UnreachableStore {
        async fn try_acquire(&self, _key: &str, _limit: u32, _window_ms: u64) -> Result<Admission, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_owned()))
        }
    }

    struct MisconfiguredStore;

    #[async_trait]
    impl WindowStore for MisconfiguredStore {
        async fn try_acquire(&self, key: &str, _limit: u32, _window_ms: u64) -> Result<Admission, StoreError> {
            Err(StoreError::Backend(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("WRONGTYPE key {key} holds the wrong kind of value"),
            ))))
        }
    }

    fn frozen_store() -> Arc<LocalWindowStore> {
        Arc::new(LocalWindowStore::with_clock(Arc::new(ManualClock::new(
            1_700_000_000_000,
        ))))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_the_limit() -> Result<()> {
        let limiter = Arc::new(DistributedRateLimiter::new(frozen_store()));
        let calls = (0..25).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow("key:burst", 10).await })
        });

        let mut granted = 0;
        let mut rejected = 0;
        for outcome in join_all(calls).await {
            if outcome??.granted {
                granted += 1;
            } else {
                rejected += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(rejected, 15);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn limiters_sharing_a_store_share_the_budget() -> Result<()> {
        let store = frozen_store();
        let first = Arc::new(DistributedRateLimiter::new(store.clone()));
        let second = Arc::new(DistributedRateLimiter::new(store.clone()));

        let calls = (0..20).map(|i| {
            let limiter = if i % 2 == 0 { first.clone() } else { second.clone() };
            tokio::spawn(async move { limiter.allow("key:shared", 10).await })
        });
        let mut granted = 0;
        for outcome in join_all(calls).await {
            if outcome??.granted {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_store_fails_open_and_reports_each_attempt() -> Result<()> {
        let sink = Arc::new(RecordingSink::default());
        let limiter = DistributedRateLimiter::new(UnreachableStore).with_events(sink.clone());

        for _ in 0..3 {
            let decision = limiter.allow("ip:10.0.0.7", 1).await?;
            assert!(decision.granted);
            assert_eq!(decision.retry_after_ms, None);
        }

        assert_eq!(limiter.degraded_count(), 3);
        let events = sink.events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.name() == "rate_limiter.degraded"));
        Ok(())
    }

    #[tokio::test]
    async fn backend_errors_propagate_with_original_source() {
        let sink = Arc::new(RecordingSink::default());
        let limiter = DistributedRateLimiter::new(MisconfiguredStore).with_events(sink.clone());

        let err = limiter.allow("key:abc", 10).await.unwrap_err();
        assert!(matches!(err, GateError::RateLimiterBackend { .. }));
        let source = err.source().expect("original error kept as source");
        let io = source
            .downcast_ref::<std::io::Error>()
            .expect("source keeps its concrete type");
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidInput);

        assert_eq!(limiter.degraded_count(), 0);
        assert!(sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn eviction_reaches_the_shared_store() -> Result<()> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(LocalWindowStore::with_clock(clock.clone()));
        let limiter = DistributedRateLimiter::new(store.clone());
        limiter.allow("key:a", 5).await?;
        limiter.allow("key:b", 5).await?;

        assert_eq!(limiter.evict_idle(Duration::from_secs(60)).await, 0);
        clock.advance(WINDOW_MS);
        assert_eq!(limiter.evict_idle(Duration::from_secs(60)).await, 2);
        assert_eq!(store.tracked_keys(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_key_never_reaches_the_store() {
        let limiter = DistributedRateLimiter::new(UnreachableStore);
        let err = limiter.allow("bad key", 10).await.unwrap_err();
        assert!(matches!(err, GateError::InvalidRateLimitKey(_)));
        assert_eq!(limiter.degraded_count(), 0);
    }
}
