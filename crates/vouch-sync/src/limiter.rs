//! Sliding-window limiter shared by every process that points at the same store.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use vouch_core::{Clock, ErrorKind, IngestError};
use vouch_storage::WindowStore;

const KEY_PREFIX: &str = "ratelimit:";

pub struct SlidingWindowLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records an attempt against `key` and reports whether fewer than `limit` attempts were
    /// already inside the trailing `window`. Rejected attempts are recorded too.
    ///
    /// A store failure is an error with kind `RateLimited`; callers must not proceed on it.
    pub async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<bool, IngestError> {
        let now = self.clock.now();
        let full_key = format!("{KEY_PREFIX}{key}");
        let count = self
            .store
            .record_and_count(&full_key, now, window)
            .await
            .map_err(|e| e.into_ingest(ErrorKind::RateLimited, "rate limit store unavailable"))?;

        let allowed = count < u64::from(limit);
        debug!(key, count, limit, allowed, "sliding window check");
        Ok(allowed)
    }

    /// Drops keys whose window has fully lapsed.
    pub async fn purge_expired(&self) -> Result<u64, IngestError> {
        self.store
            .purge_expired(self.clock.now())
            .await
            .map_err(|e| e.into_ingest(ErrorKind::RateLimited, "rate limit store unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use vouch_core::ManualClock;
    use vouch_storage::{MemoryWindowStore, StoreError};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("ts")
    }

    fn limiter() -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let limiter = SlidingWindowLimiter::new(Arc::new(MemoryWindowStore::new()), clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn third_call_inside_window_is_rejected() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(1);

        assert!(limiter.allow("twitter", 2, window).await.expect("first"));
        clock.advance(Duration::from_millis(200));
        assert!(limiter.allow("twitter", 2, window).await.expect("second"));
        clock.advance(Duration::from_millis(200));
        assert!(!limiter.allow("twitter", 2, window).await.expect("third"));
    }

    #[tokio::test]
    async fn admitted_calls_never_exceed_limit_in_any_trailing_window() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(10);
        let limit = 3;
        let mut admitted: Vec<DateTime<Utc>> = Vec::new();

        // Irregular spacing, including bursts and gaps longer than the window.
        let steps_ms = [0, 100, 100, 100, 2_000, 3_000, 4_900, 50, 12_000, 10, 10, 10, 9_990, 1];
        for step in steps_ms {
            clock.advance(Duration::from_millis(step));
            if limiter.allow("k", limit, window).await.expect("allow") {
                admitted.push(clock.now());
            }
        }

        let window = chrono::Duration::seconds(10);
        for end in &admitted {
            let in_window = admitted
                .iter()
                .filter(|at| **at > *end - window && **at <= *end)
                .count();
            assert!(in_window <= limit as usize, "{in_window} admitted in window ending {end}");
        }
        assert!(admitted.len() >= limit as usize);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let (limiter, _) = limiter();
        let window = Duration::from_secs(60);
        assert!(limiter.allow("yelp", 1, window).await.expect("yelp"));
        assert!(!limiter.allow("yelp", 1, window).await.expect("yelp again"));
        assert!(limiter.allow("google", 1, window).await.expect("google"));
    }

    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn record_and_count(
            &self,
            _key: &str,
            _now: DateTime<Utc>,
            _window: Duration,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_store_is_an_error_not_an_allow() {
        let limiter = SlidingWindowLimiter::new(Arc::new(DownStore), Arc::new(ManualClock::new(t0())));
        let err = limiter
            .allow("twitter", 100, Duration::from_secs(1))
            .await
            .expect_err("store down");
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }
}
