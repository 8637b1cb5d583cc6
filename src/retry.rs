//! Retry/backoff controller and quota shaping.
//!
//! [`RetryPolicy`] wraps any remote operation returning a classified
//! [`StoreError`](crate::error::StoreError): transient failures are retried
//! with exponential backoff and jitter up to a bounded attempt count;
//! permanent failures surface immediately. Exhausting the budget yields
//! `RetriesExhausted`, distinct from a permanent failure.
//!
//! [`RateLimiter`] is a token bucket ([`governor`]) used by the store
//! client to shape request rate under the remote API's quota, so backoff
//! handles bursts instead of every request tripping the quota.
//!
//! # Backoff Schedule
//!
//! Delay for attempt n (0-indexed) is `min(base * 2^n, max_delay)` plus
//! uniform jitter in `[0, delay/2]`. Jitter desynchronizes concurrent
//! writers retrying against the same quota.

use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::StoreResult;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovLimiter};
use rand::Rng;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for remote operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt budget (first try included).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Whether to add random jitter in `[0, delay/2]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Fast-fail policy for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: false,
        }
    }

    /// Backoff delay for a retry (0-indexed attempt), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        std::cmp::min(delay, self.max_delay)
    }

    /// Upper bound on total time spent sleeping across the whole budget.
    pub fn max_backoff_total(&self) -> Duration {
        let mut total = Duration::ZERO;
        for attempt in 0..self.max_attempts.saturating_sub(1) {
            let delay = self.delay_for_attempt(attempt);
            // Jitter adds at most half the delay
            total += delay + delay / 2;
        }
        total
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let half = delay.as_millis() as u64 / 2;
        if half == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=half);
        delay + Duration::from_millis(extra)
    }

    /// Run an operation under this policy.
    ///
    /// `f` is invoked up to `max_attempts` times. Transient failures sleep
    /// the backoff schedule between attempts; permanent failures return
    /// immediately as `SyncError::Store`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.jittered(self.delay_for_attempt(attempt));
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure; backing off"
                    );
                    metrics::record_retry(operation);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(operation, attempts = attempt + 1, "Retry budget exhausted");
                    metrics::record_retries_exhausted(operation);
                    return Err(SyncError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                Err(e) => {
                    debug!(operation, error = %e, "Permanent failure; not retrying");
                    return Err(SyncError::Store(e));
                }
            }
        }
    }
}

/// Quota limit for the remote API.
///
/// The default matches the common per-user write quota of spreadsheet
/// backends (60 requests per minute), with a small burst allowance.
#[derive(Debug, Clone)]
pub struct QuotaLimit {
    /// Sustained requests per minute.
    pub requests_per_minute: u32,
    /// Maximum burst above the sustained rate.
    pub burst: u32,
}

impl Default for QuotaLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

/// Token bucket rate limiter shaping requests under the remote quota.
///
/// Thread-safe and async-aware; `acquire` is cancel-safe.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    limit: QuotaLimit,
}

impl RateLimiter {
    /// Create a rate limiter for the given quota.
    pub fn new(limit: QuotaLimit) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(limit.requests_per_minute).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(limit.burst).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovLimiter::direct(quota),
            limit,
        }
    }

    /// Acquire a permit, waiting until one is available.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// The configured quota.
    pub fn limit(&self) -> &QuotaLimit {
        &self.limit
    }
}
