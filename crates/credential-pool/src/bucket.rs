//! Token bucket with lazy refill
//!
//! Capacity equals the configured per-minute limit; the refill rate is
//! limit/60 per second, computed lazily from elapsed wall time whenever the
//! bucket is touched. The balance may go negative through `force_consume`
//! (reconciling an under-estimated reservation): the current request is not
//! blocked, but the debt must refill before the next admission.
//!
//! Limits of zero or below are normalized to unlimited, matching provider
//! responses that report "no limit" as 0 or -1.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Poll interval for blocking waits. Short enough that cancellation and
/// limit changes are observed well inside the 50 ms responsiveness bound.
const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct BucketState {
    /// None means unlimited: every admission succeeds.
    rate_per_sec: Option<f64>,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let Some(rate) = self.rate_per_sec else {
            return;
        };
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}

/// A single token bucket guarding one rate dimension of one credential.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket for a per-minute limit. Limits ≤ 0 are unlimited.
    pub fn per_minute(limit: i64) -> Self {
        let state = if limit <= 0 {
            BucketState {
                rate_per_sec: None,
                capacity: f64::INFINITY,
                tokens: f64::INFINITY,
                last_refill: Instant::now(),
            }
        } else {
            let capacity = limit as f64;
            BucketState {
                rate_per_sec: Some(capacity / 60.0),
                capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            }
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Whether the bucket is unlimited.
    pub fn is_unlimited(&self) -> bool {
        self.state.lock().unwrap().rate_per_sec.is_none()
    }

    /// Current balance after lazy refill. May be negative while a
    /// reconciliation debt is outstanding.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.refill(Instant::now());
        state.tokens
    }

    /// Fraction of capacity currently available, in `0.0..=1.0`. Unlimited
    /// buckets report 1.0.
    pub fn remaining_fraction(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        if state.rate_per_sec.is_none() {
            return 1.0;
        }
        state.refill(Instant::now());
        (state.tokens / state.capacity).clamp(0.0, 1.0)
    }

    /// Non-blocking check without consuming.
    pub fn can_admit(&self, n: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.rate_per_sec.is_none() {
            return true;
        }
        state.refill(Instant::now());
        state.tokens >= n as f64
    }

    /// Consume `n` tokens if the balance allows it, without blocking.
    pub fn try_consume(&self, n: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.rate_per_sec.is_none() {
            return Ok(());
        }
        state.refill(Instant::now());
        let n = n as f64;
        if state.tokens >= n {
            state.tokens -= n;
            Ok(())
        } else {
            Err(Error::RateLimitExceeded(format!(
                "need {n} tokens, {:.1} available",
                state.tokens
            )))
        }
    }

    /// Consume `n` tokens, waiting for refill if necessary.
    ///
    /// Returns `Error::Cancelled` promptly when the token fires, and
    /// `Error::RateLimitExceeded` when `n` exceeds the bucket capacity and
    /// could therefore never be satisfied.
    pub async fn consume(&self, n: u64, cancel: &CancellationToken) -> Result<()> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.rate_per_sec.is_none() {
                    return Ok(());
                }
                state.refill(Instant::now());
                let need = n as f64;
                if need > state.capacity {
                    return Err(Error::RateLimitExceeded(format!(
                        "requested {n} tokens exceeds bucket capacity {:.0}",
                        state.capacity
                    )));
                }
                if state.tokens >= need {
                    state.tokens -= need;
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(WAIT_SLICE) => {}
            }
        }
    }

    /// Return `n` tokens, clamped to capacity. Used when a reservation
    /// exceeded the actual usage.
    pub fn refund(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        if state.rate_per_sec.is_none() {
            return;
        }
        state.tokens = (state.tokens + n as f64).min(state.capacity);
    }

    /// Consume `n` tokens unconditionally, allowing the balance to go
    /// negative. Used when actual usage exceeded the reservation: the
    /// overage is charged as debt against future admissions.
    pub fn force_consume(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        if state.rate_per_sec.is_none() {
            return;
        }
        state.refill(Instant::now());
        state.tokens -= n as f64;
    }

    /// Replace the limit, rebuilding rate and capacity atomically. The
    /// current balance is carried over, clamped into the new capacity, so a
    /// shrinking limit takes effect immediately and a growing one does not
    /// grant a free burst.
    pub fn set_limit(&self, per_minute: i64) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.refill(now);
        if per_minute <= 0 {
            state.rate_per_sec = None;
            state.capacity = f64::INFINITY;
            state.tokens = f64::INFINITY;
        } else {
            let capacity = per_minute as f64;
            let carried = if state.tokens.is_finite() {
                state.tokens.min(capacity)
            } else {
                capacity
            };
            state.rate_per_sec = Some(capacity / 60.0);
            state.capacity = capacity;
            state.tokens = carried;
        }
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_admits_up_to_capacity() {
        let bucket = TokenBucket::per_minute(10);
        for _ in 0..10 {
            bucket.try_consume(1).unwrap();
        }
        assert!(bucket.try_consume(1).is_err());
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let bucket = TokenBucket::per_minute(0);
        assert!(bucket.is_unlimited());
        for _ in 0..1000 {
            bucket.try_consume(100).unwrap();
        }
    }

    #[test]
    fn negative_limit_is_unlimited() {
        let bucket = TokenBucket::per_minute(-5);
        assert!(bucket.is_unlimited());
        bucket.try_consume(u64::MAX / 2).unwrap();
    }

    #[test]
    fn refund_restores_balance() {
        let bucket = TokenBucket::per_minute(100);
        bucket.try_consume(60).unwrap();
        bucket.refund(30);
        assert!(bucket.available() >= 69.0);
    }

    #[test]
    fn refund_clamps_to_capacity() {
        let bucket = TokenBucket::per_minute(100);
        bucket.refund(500);
        assert!(bucket.available() <= 100.0);
    }

    #[test]
    fn force_consume_goes_negative() {
        let bucket = TokenBucket::per_minute(10);
        bucket.try_consume(10).unwrap();
        bucket.force_consume(5);
        assert!(bucket.available() < 0.0);
        assert!(bucket.try_consume(1).is_err());
    }

    #[test]
    fn set_limit_shrinks_balance() {
        let bucket = TokenBucket::per_minute(1000);
        bucket.set_limit(10);
        assert!(bucket.available() <= 10.0);
        bucket.try_consume(10).unwrap();
        assert!(bucket.try_consume(1).is_err());
    }

    #[test]
    fn set_limit_to_unlimited() {
        let bucket = TokenBucket::per_minute(1);
        bucket.try_consume(1).unwrap();
        bucket.set_limit(0);
        bucket.try_consume(10_000).unwrap();
    }

    #[tokio::test]
    async fn consume_waits_for_refill() {
        let bucket = TokenBucket::per_minute(6000); // 100 tokens/sec
        bucket.try_consume(6000).unwrap();
        let cancel = CancellationToken::new();

        let start = Instant::now();
        bucket.consume(5, &cancel).await.unwrap();
        // Five tokens refill in ~50ms of wall time.
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn consume_cancelled_promptly() {
        let bucket = TokenBucket::per_minute(1);
        bucket.try_consume(1).unwrap();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let err = bucket.consume(1, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn consume_rejects_impossible_request() {
        let bucket = TokenBucket::per_minute(10);
        let cancel = CancellationToken::new();
        let err = bucket.consume(100, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded(_)));
    }

    #[test]
    fn refill_is_gradual() {
        let bucket = TokenBucket::per_minute(6000); // 100 tokens/sec
        bucket.try_consume(6000).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let available = bucket.available();
        // ~5 tokens after 50ms, certainly not a full refill.
        assert!(available > 0.0, "expected partial refill, got {available}");
        assert!(available < 100.0, "refill too fast: {available}");
    }
}
