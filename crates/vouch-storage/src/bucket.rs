//! Process-local token bucket with an adjustable refill rate.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vouch_core::IngestError;

/// Rates below this are clamped so a throttled bucket still drains eventually.
pub const MIN_RATE_PER_SEC: f64 = 0.001;

#[derive(Debug)]
pub struct TokenBucket {
    burst: f64,
    base_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(burst);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Starts full: `burst` tokens, refilled at `rate_per_sec`.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let rate = rate_per_sec.max(MIN_RATE_PER_SEC);
        Self {
            burst,
            base_rate: rate,
            state: Mutex::new(BucketState {
                tokens: burst,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until a token is available or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), IngestError> {
        loop {
            let sleep_for = {
                let mut state = self.state.lock().await;
                state.refill(self.burst, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::cancelled("token bucket wait")),
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Changes the refill rate; tokens already in the bucket are kept.
    pub async fn set_limit(&self, rate_per_sec: f64) {
        let mut state = self.state.lock().await;
        state.refill(self.burst, Instant::now());
        state.rate = rate_per_sec.max(MIN_RATE_PER_SEC);
    }

    pub async fn reset_rate(&self) {
        self.set_limit(self.base_rate).await;
    }

    pub async fn rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.burst, Instant::now());
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouch_core::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn burst_is_served_immediately_then_paced() {
        let bucket = TokenBucket::new(2.0, 2);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        bucket.wait(&cancel).await.expect("first");
        bucket.wait(&cancel).await.expect("second");
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.wait(&cancel).await.expect("third");
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn set_limit_keeps_current_tokens() {
        let bucket = TokenBucket::new(10.0, 5);
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.expect("take one");
        bucket.wait(&cancel).await.expect("take two");

        bucket.set_limit(0.5).await;
        assert!((bucket.rate().await - 0.5).abs() < f64::EPSILON);
        assert!((bucket.available().await - 3.0).abs() < 1e-9);

        bucket.reset_rate().await;
        assert!((bucket.rate().await - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_cancelled_when_token_fires() {
        let bucket = TokenBucket::new(0.01, 1);
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.expect("burst token");

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = bucket.wait(&cancel).await.expect_err("must cancel");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
