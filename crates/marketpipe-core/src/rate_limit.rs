use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::RateLimitError;

// Tolerance for float rounding in the refill math.
const TOKEN_EPSILON: f64 = 1e-9;

/// Throttle contract shared by the fetch clients.
///
/// Implemented by [`RateLimiter`] and [`DualRateLimiter`] so a client can take
/// `Arc<dyn Throttle>` and not care whether the provider has compound limits.
pub trait Throttle: Send + Sync {
    fn acquire(&self) -> Result<(), RateLimitError>;

    fn acquire_async<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), RateLimitError>> + Send + 'a>>;

    /// Server-instructed cooldown (HTTP 429 `Retry-After`). Blocks the caller
    /// for the full duration and suppresses every other acquire until the
    /// deadline passes.
    fn notify_retry_after(&self, wait: Duration);

    fn notify_retry_after_async<'a>(
        &'a self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Forced-wait counters, partitioned by the path that blocked.
///
/// Observability only; correctness never depends on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitCounts {
    pub sync_waits: u64,
    pub async_waits: u64,
    pub cooldown_waits: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

enum Admission {
    Admitted,
    Wait(Duration),
}

/// Token-bucket rate limiter with lazy refill.
///
/// Safe under simultaneous sync-thread and async-task access to one instance:
/// bucket mutation is serialized behind a mutex, and neither acquire path holds
/// the lock while sleeping.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_rate: f64,
    state: Mutex<BucketState>,
    sync_waits: AtomicU64,
    async_waits: AtomicU64,
    cooldown_waits: AtomicU64,
}

impl RateLimiter {
    /// Create a bucket holding at most `capacity` tokens, refilling at
    /// `refill_rate` tokens per second. The bucket starts full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate: refill_rate.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
                cooldown_until: None,
            }),
            sync_waits: AtomicU64::new(0),
            async_waits: AtomicU64::new(0),
            cooldown_waits: AtomicU64::new(0),
        }
    }

    /// Convenience constructor for "N per window" provider limits.
    pub fn per_window(limit: u32, window: Duration) -> Self {
        let rate = f64::from(limit) / window.as_secs_f64().max(f64::MIN_POSITIVE);
        Self::new(limit, rate)
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Blocking acquire. Sleeps in a re-checking loop until `tokens` are
    /// available and no cooldown is active.
    pub fn acquire(&self, tokens: u32) -> Result<(), RateLimitError> {
        loop {
            match self.try_admit(tokens)? {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => {
                    self.sync_waits.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(wait);
                }
            }
        }
    }

    /// Cooperative acquire with identical semantics to [`acquire`](Self::acquire).
    pub async fn acquire_async(&self, tokens: u32) -> Result<(), RateLimitError> {
        loop {
            match self.try_admit(tokens)? {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => {
                    self.async_waits.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Drain the bucket, record the cooldown deadline, and block the caller
    /// for the full duration.
    pub fn notify_retry_after(&self, wait: Duration) {
        self.begin_cooldown(wait);
        self.cooldown_waits.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(wait);
    }

    pub async fn notify_retry_after_async(&self, wait: Duration) {
        self.begin_cooldown(wait);
        self.cooldown_waits.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(wait).await;
    }

    /// Current token level after lazy refill. Zero while a cooldown is active.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock_state();
        let now = Instant::now();
        if let Some(deadline) = state.cooldown_until {
            if now < deadline {
                return 0.0;
            }
            state.cooldown_until = None;
        }
        self.refill(&mut state, now);
        state.tokens
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.lock_state();
        let deadline = state.cooldown_until?;
        deadline.checked_duration_since(Instant::now())
    }

    pub fn wait_counts(&self) -> WaitCounts {
        WaitCounts {
            sync_waits: self.sync_waits.load(Ordering::Relaxed),
            async_waits: self.async_waits.load(Ordering::Relaxed),
            cooldown_waits: self.cooldown_waits.load(Ordering::Relaxed),
        }
    }

    /// Drain to zero and extend the cooldown deadline. Never shortens an
    /// already-recorded deadline.
    fn begin_cooldown(&self, wait: Duration) {
        let mut state = self.lock_state();
        let now = Instant::now();
        state.tokens = 0.0;
        state.last_refill = now;
        let deadline = now + wait;
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) if existing > deadline => existing,
            _ => deadline,
        });
    }

    fn try_admit(&self, tokens: u32) -> Result<Admission, RateLimitError> {
        if tokens > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: tokens,
                capacity: self.capacity,
            });
        }

        let mut state = self.lock_state();
        let now = Instant::now();

        if let Some(deadline) = state.cooldown_until {
            if let Some(remaining) = deadline.checked_duration_since(now) {
                return Ok(Admission::Wait(remaining));
            }
            state.cooldown_until = None;
        }

        self.refill(&mut state, now);

        let needed = f64::from(tokens);
        if state.tokens + TOKEN_EPSILON >= needed {
            state.tokens = (state.tokens - needed).max(0.0);
            return Ok(Admission::Admitted);
        }

        let deficit = needed - state.tokens;
        Ok(Admission::Wait(Duration::from_secs_f64(
            deficit / self.refill_rate,
        )))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(f64::from(self.capacity));
        state.last_refill = now;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().expect("rate limiter state lock poisoned")
    }
}

impl Throttle for RateLimiter {
    fn acquire(&self) -> Result<(), RateLimitError> {
        RateLimiter::acquire(self, 1)
    }

    fn acquire_async<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), RateLimitError>> + Send + 'a>> {
        Box::pin(async move { RateLimiter::acquire_async(self, 1).await })
    }

    fn notify_retry_after(&self, wait: Duration) {
        RateLimiter::notify_retry_after(self, wait);
    }

    fn notify_retry_after_async<'a>(
        &'a self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move { RateLimiter::notify_retry_after_async(self, wait).await })
    }
}

/// Compound limiter for providers with per-second and per-minute quotas.
///
/// Acquire order is tight-then-loose: the per-second bucket is consulted first
/// so the per-minute budget is never spent on a call the tighter bucket would
/// still block. There is no rollback when the loose bucket blocks; the tight
/// token stays consumed. That waste is bounded and accepted.
#[derive(Debug)]
pub struct DualRateLimiter {
    per_second: RateLimiter,
    per_minute: RateLimiter,
}

impl DualRateLimiter {
    pub fn new(per_second: RateLimiter, per_minute: RateLimiter) -> Self {
        Self {
            per_second,
            per_minute,
        }
    }

    /// Build from raw quota numbers, e.g. `(30, 60)` for 30/sec and 60/min.
    pub fn from_limits(second_limit: u32, minute_limit: u32) -> Self {
        Self::new(
            RateLimiter::per_window(second_limit, Duration::from_secs(1)),
            RateLimiter::per_window(minute_limit, Duration::from_secs(60)),
        )
    }

    pub fn acquire(&self, tokens: u32) -> Result<(), RateLimitError> {
        self.per_second.acquire(tokens)?;
        self.per_minute.acquire(tokens)
    }

    pub async fn acquire_async(&self, tokens: u32) -> Result<(), RateLimitError> {
        self.per_second.acquire_async(tokens).await?;
        self.per_minute.acquire_async(tokens).await
    }

    pub fn notify_retry_after(&self, wait: Duration) {
        self.per_second.begin_cooldown(wait);
        self.per_minute.notify_retry_after(wait);
    }

    pub async fn notify_retry_after_async(&self, wait: Duration) {
        self.per_second.begin_cooldown(wait);
        self.per_minute.notify_retry_after_async(wait).await;
    }

    pub const fn per_second(&self) -> &RateLimiter {
        &self.per_second
    }

    pub const fn per_minute(&self) -> &RateLimiter {
        &self.per_minute
    }
}

impl Throttle for DualRateLimiter {
    fn acquire(&self) -> Result<(), RateLimitError> {
        DualRateLimiter::acquire(self, 1)
    }

    fn acquire_async<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), RateLimitError>> + Send + 'a>> {
        Box::pin(async move { DualRateLimiter::acquire_async(self, 1).await })
    }

    fn notify_retry_after(&self, wait: Duration) {
        DualRateLimiter::notify_retry_after(self, wait);
    }

    fn notify_retry_after_async<'a>(
        &'a self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move { DualRateLimiter::notify_retry_after_async(self, wait).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_admits_up_to_capacity() {
        let limiter = RateLimiter::new(3, 1.0);
        limiter.acquire(3).expect("burst within capacity");
        assert!(limiter.available_tokens() < 1.0);
    }

    #[test]
    fn rejects_unsatisfiable_request() {
        let limiter = RateLimiter::new(2, 1.0);
        let err = limiter.acquire(3).expect_err("must fail immediately");
        assert_eq!(
            err,
            RateLimitError::ExceedsCapacity {
                requested: 3,
                capacity: 2
            }
        );
    }

    #[test]
    fn refill_clamps_at_capacity_after_idle() {
        let limiter = RateLimiter::new(2, 1_000.0);
        limiter.acquire(2).expect("drain");
        std::thread::sleep(Duration::from_millis(20));
        let available = limiter.available_tokens();
        assert!(available <= 2.0 + TOKEN_EPSILON, "available = {available}");
        assert!(available >= 1.9, "available = {available}");
    }

    #[test]
    fn cooldown_suppresses_available_tokens() {
        let limiter = RateLimiter::new(5, 1_000.0);
        limiter.notify_retry_after(Duration::from_millis(30));
        // Deadline has passed by the time notify returns; arm a fresh one
        // without sleeping to observe suppression.
        limiter.begin_cooldown(Duration::from_millis(50));
        assert_eq!(limiter.available_tokens(), 0.0);
        assert!(limiter.cooldown_remaining().is_some());
    }

    #[test]
    fn wait_counters_track_blocked_paths() {
        let limiter = RateLimiter::new(1, 1_000.0);
        limiter.acquire(1).expect("first is free");
        limiter.acquire(1).expect("second refills quickly");
        let counts = limiter.wait_counts();
        assert!(counts.sync_waits >= 1);
        assert_eq!(counts.async_waits, 0);
    }
}
