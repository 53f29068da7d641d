//! Token-bucket rate limiting for outbound policy lookups.
//!
//! A single [`RateLimiter`] is shared by every worker of every batch in the
//! process. Waiters reserve a token up front (the balance may go negative)
//! and sleep until their reservation matures, so concurrent callers are
//! admitted in arrival order at the configured rate.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LimiterError;

/// Slowest refill rate accepted by [`RateLimiter::new`]: one token every
/// thousand seconds.
pub const MIN_RATE_PER_SECOND: f64 = 0.001;

pub struct RateLimiter {
    rate_per_second: f64,
    burst_size: u32,
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    /// Current balance. Negative while reservations are outstanding.
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    /// Deadline of the newest reservation.
    last_deadline: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
            last_deadline: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn time_for(&self, tokens: f64) -> Duration {
        Duration::from_secs_f64(tokens / self.refill_rate)
    }

    /// Take one token and return the instant at which the caller may act.
    fn reserve(&mut self, now: Instant) -> Instant {
        self.refill(now);
        self.tokens -= 1.0;
        let deadline = if self.tokens >= 0.0 {
            now
        } else {
            now + self.time_for(-self.tokens)
        };
        self.last_deadline = deadline;
        deadline
    }

    /// Hand back the reservation maturing at `deadline`.
    ///
    /// Reservations made after it already count on part of its token, so
    /// only the share not spanned by `deadline..last_deadline` is restored.
    fn release(&mut self, now: Instant, deadline: Instant) {
        let committed = self
            .last_deadline
            .saturating_duration_since(deadline)
            .as_secs_f64()
            * self.refill_rate;
        let restore = 1.0 - committed;
        if restore <= 0.0 {
            return;
        }

        self.refill(now);
        self.tokens = (self.tokens + restore).min(self.capacity);

        if deadline == self.last_deadline {
            if let Some(previous) = deadline.checked_sub(self.time_for(1.0)) {
                if previous >= now {
                    self.last_deadline = previous;
                }
            }
        }
    }
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket of `burst_size` tokens.
    pub fn new(rate_per_second: f64, burst_size: u32) -> Result<Self, LimiterError> {
        if !rate_per_second.is_finite() || rate_per_second < MIN_RATE_PER_SECOND {
            return Err(LimiterError::InvalidConfig(format!(
                "rate_per_second must be at least {MIN_RATE_PER_SECOND}, got {rate_per_second}"
            )));
        }
        if burst_size == 0 {
            return Err(LimiterError::InvalidConfig(
                "burst_size must be at least 1".into(),
            ));
        }

        Ok(Self {
            rate_per_second,
            burst_size,
            bucket: Mutex::new(TokenBucket::new(f64::from(burst_size), rate_per_second)),
        })
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    /// Wait for one token.
    ///
    /// Returns [`LimiterError::Cancelled`] as soon as `cancel` fires, whether
    /// it was already raised on entry or is raised mid-wait. A cancelled
    /// reservation hands back whatever share of its token later reservations
    /// have not already been promised.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }

        let now = Instant::now();
        let deadline = self.lock().reserve(now);
        if deadline <= now {
            return Ok(());
        }

        tracing::trace!(
            wait_ms = (deadline - now).as_millis() as u64,
            "Waiting for rate limiter token"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.lock().release(Instant::now(), deadline);
                Err(LimiterError::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_per_second", &self.rate_per_second)
            .field("burst_size", &self.burst_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_invalid_config() {
        assert!(RateLimiter::new(0.0, 4).is_err());
        assert!(RateLimiter::new(-1.0, 4).is_err());
        assert!(RateLimiter::new(f64::NAN, 4).is_err());
        assert!(RateLimiter::new(f64::INFINITY, 4).is_err());
        assert!(RateLimiter::new(1e-20, 1).is_err());
        assert!(RateLimiter::new(MIN_RATE_PER_SECOND, 1).is_ok());
        assert!(RateLimiter::new(10.0, 0).is_err());
        assert!(RateLimiter::new(10.0, 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_admitted_immediately() {
        let limiter = RateLimiter::new(1.0, 4).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..4 {
            limiter.acquire(&cancel).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_past_burst_takes_k_over_rate() {
        // burst 4 + k 5 at 10/s: the last token matures after 0.5s.
        let limiter = Arc::new(RateLimiter::new(10.0, 4).unwrap());
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { limiter.acquire(&cancel).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "drained too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "drained too slow: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_returns_without_consuming() {
        let limiter = RateLimiter::new(1.0, 1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(limiter.acquire(&cancel).await, Err(LimiterError::Cancelled));

        // The single token is still available.
        let fresh = CancellationToken::new();
        let start = Instant::now();
        limiter.acquire(&fresh).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_returns_before_refill_and_releases_token() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1).unwrap());
        let start = Instant::now();
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(LimiterError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(100));

        // Had the cancelled reservation kept its token, this would wait until 2s.
        let fresh = CancellationToken::new();
        limiter.acquire(&fresh).await.unwrap();
        assert!(start.elapsed() <= Duration::from_millis(1100), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn slowest_rate_waits_without_overflow() {
        let limiter = RateLimiter::new(MIN_RATE_PER_SECOND, 1).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1000), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_queued_wait_keeps_later_admissions_spaced() {
        // 1/s, burst 1: A now, B queued for 1s, C queued for 2s.
        let limiter = Arc::new(RateLimiter::new(1.0, 1).unwrap());
        let start = Instant::now();
        limiter.acquire(&CancellationToken::new()).await.unwrap();

        let b_cancel = CancellationToken::new();
        let b = {
            let limiter = Arc::clone(&limiter);
            let cancel = b_cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };
        let c = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.acquire(&CancellationToken::new()).await.unwrap();
                Instant::now()
            })
        };
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        b_cancel.cancel();
        assert_eq!(b.await.unwrap(), Err(LimiterError::Cancelled));

        limiter.acquire(&CancellationToken::new()).await.unwrap();
        let d_at = Instant::now();
        let c_at = c.await.unwrap();

        assert!(c_at - start >= Duration::from_secs(2), "{:?}", c_at - start);
        assert!(
            d_at.saturating_duration_since(c_at) >= Duration::from_millis(990),
            "C at {:?}, D at {:?}",
            c_at - start,
            d_at - start
        );
    }
}
