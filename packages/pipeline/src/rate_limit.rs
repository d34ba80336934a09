//! Per-provider rate-limit coordination.
//!
//! One token bucket per upstream provider, shared by every worker in the
//! process. Admission is a single check-then-increment under the bucket
//! lock; the window rotates lazily on access. A 429 from a provider is
//! reported back here so the whole pool backs off together instead of
//! each worker rolling its own sleep loop.
//!
//! The limiter never fails: [`RateLimiter::acquire`] either grants within
//! the caller's budget or reports a timeout, which callers treat as a
//! transient condition.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::stages::Provider;

/// Ceiling on one blocked re-check interval while waiting for tokens.
const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for one rate-limited provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub max_requests: u32,
    /// Window length for the request counter.
    pub window: Duration,
    /// Minimum gap between consecutive grants observed by this process,
    /// regardless of bucket state.
    pub min_delay: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration, min_delay: Duration) -> Self {
        Self {
            max_requests,
            window,
            min_delay,
        }
    }
}

/// Default bucket seeds per provider.
pub fn default_rate_limits() -> HashMap<Provider, RateLimitConfig> {
    HashMap::from([
        (
            Provider::LlmProvider,
            RateLimitConfig::new(60, Duration::from_secs(60), Duration::from_secs(1)),
        ),
        (
            Provider::CitationsProvider,
            RateLimitConfig::new(100, Duration::from_secs(60), Duration::from_millis(100)),
        ),
        (
            Provider::Github,
            RateLimitConfig::new(5000, Duration::from_secs(3600), Duration::from_millis(100)),
        ),
        (
            Provider::Local,
            RateLimitConfig::new(10_000, Duration::from_secs(60), Duration::ZERO),
        ),
    ])
}

/// Outcome of an [`RateLimiter::acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AcquireOutcome {
    Granted,
    /// The caller's wait budget expired before a token freed up. Transient;
    /// re-queue and try again later.
    TimedOut,
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }
}

/// Current bucket state for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub provider: Provider,
    pub requests_count: u32,
    pub max_requests: u32,
    pub remaining: u32,
    pub window_seconds: u64,
    pub seconds_until_reset: u64,
    pub is_backed_off: bool,
    pub backoff_remaining_seconds: u64,
}

struct Bucket {
    config: RateLimitConfig,
    requests_count: u32,
    window_start: Instant,
    last_grant: Option<Instant>,
    backoff_until: Option<Instant>,
}

impl Bucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            requests_count: 0,
            window_start: now,
            last_grant: None,
            backoff_until: None,
        }
    }

    /// Lazy window rotation: once `now` exits the current window, the
    /// counter resets and a fresh window starts at `now`.
    fn rotate_if_elapsed(&mut self, now: Instant) {
        if now >= self.window_start + self.config.window {
            self.requests_count = 0;
            self.window_start = now;
        }
    }
}

enum Decision {
    Granted,
    Wait(Duration),
}

/// Token buckets shared across all workers in the process.
///
/// Constructed once at process start and passed into the worker pool; all
/// mutation happens under the bucket-map lock, which is never held across
/// an await point.
pub struct RateLimiter {
    buckets: Mutex<HashMap<Provider, Bucket>>,
}

impl RateLimiter {
    pub fn new(configs: HashMap<Provider, RateLimitConfig>) -> Self {
        let now = Instant::now();
        let buckets = configs
            .into_iter()
            .map(|(provider, config)| (provider, Bucket::new(config, now)))
            .collect();

        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Limiter seeded with the default provider configs.
    pub fn seeded() -> Self {
        Self::new(default_rate_limits())
    }

    /// Acquire permission to make one request to `provider`.
    ///
    /// Blocks up to `timeout`, re-checking at short intervals. Admission
    /// order across contenders is not strictly FIFO; the budget refill
    /// keeps every waiter from starving indefinitely.
    pub async fn acquire(&self, provider: Provider, timeout: Duration) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            match self.try_acquire(provider) {
                Decision::Granted => return AcquireOutcome::Granted,
                Decision::Wait(wait) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return AcquireOutcome::TimedOut;
                    }
                    tokio::time::sleep(wait.min(deadline - now)).await;
                }
            }
        }
    }

    /// One admission attempt under the lock.
    fn try_acquire(&self, provider: Provider) -> Decision {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let bucket = buckets.entry(provider).or_insert_with(|| {
            warn!(provider = %provider, "no rate limit configured; using permissive default");
            Bucket::new(
                RateLimitConfig::new(1000, Duration::from_secs(60), Duration::ZERO),
                now,
            )
        });

        if let Some(until) = bucket.backoff_until {
            if now < until {
                return Decision::Wait(until - now);
            }
            bucket.backoff_until = None;
        }

        bucket.rotate_if_elapsed(now);

        // Local minimum spacing between grants, independent of the bucket.
        if let Some(last) = bucket.last_grant {
            let min_delay = bucket.config.min_delay;
            if now < last + min_delay {
                return Decision::Wait(last + min_delay - now);
            }
        }

        if bucket.requests_count < bucket.config.max_requests {
            bucket.requests_count += 1;
            bucket.last_grant = Some(now);
            return Decision::Granted;
        }

        let window_ends = bucket.window_start + bucket.config.window;
        Decision::Wait((window_ends - now).min(RECHECK_INTERVAL))
    }

    /// Record a 429 (or equivalent throttle signal) from a provider.
    ///
    /// Sets the backoff deadline and saturates the counter so concurrent
    /// acquirers observe the block immediately. Non-blocking.
    pub fn report_limit_hit(&self, provider: Provider, backoff: Duration) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(bucket) = buckets.get_mut(&provider) {
            warn!(
                provider = %provider,
                backoff_secs = backoff.as_secs(),
                "rate limit hit; backing off"
            );
            bucket.backoff_until = Some(now + backoff);
            bucket.requests_count = bucket.config.max_requests;
        }
    }

    /// Drop the backoff deadline for a provider.
    pub fn clear_backoff(&self, provider: Provider) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get_mut(&provider) {
            if bucket.backoff_until.take().is_some() {
                info!(provider = %provider, "backoff cleared");
            }
        }
    }

    /// Snapshot of one provider's bucket.
    pub fn stats(&self, provider: Provider) -> Option<RateLimitStats> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.get(&provider).map(|b| snapshot(provider, b))
    }

    /// Snapshots of every configured bucket, ordered by provider.
    pub fn all_stats(&self) -> Vec<RateLimitStats> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats: Vec<RateLimitStats> = buckets
            .iter()
            .map(|(provider, bucket)| snapshot(*provider, bucket))
            .collect();
        stats.sort_by_key(|s| s.provider);
        stats
    }
}

fn snapshot(provider: Provider, bucket: &Bucket) -> RateLimitStats {
    let now = Instant::now();
    let window_ends = bucket.window_start + bucket.config.window;
    let seconds_until_reset = window_ends.saturating_duration_since(now).as_secs();

    let backoff_remaining = bucket
        .backoff_until
        .map(|until| until.saturating_duration_since(now))
        .unwrap_or(Duration::ZERO);

    RateLimitStats {
        provider,
        requests_count: bucket.requests_count,
        max_requests: bucket.config.max_requests,
        remaining: bucket.config.max_requests.saturating_sub(bucket.requests_count),
        window_seconds: bucket.config.window.as_secs(),
        seconds_until_reset,
        is_backed_off: backoff_remaining > Duration::ZERO,
        backoff_remaining_seconds: backoff_remaining.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64, min_delay_ms: u64) -> RateLimiter {
        RateLimiter::new(HashMap::from([(
            Provider::LlmProvider,
            RateLimitConfig::new(
                max,
                Duration::from_secs(window_secs),
                Duration::from_millis(min_delay_ms),
            ),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_the_window_budget() {
        let limiter = limiter(3, 60, 0);

        for _ in 0..3 {
            let outcome = limiter.acquire(Provider::LlmProvider, Duration::ZERO).await;
            assert!(outcome.is_granted());
        }

        let outcome = limiter.acquire(Provider::LlmProvider, Duration::ZERO).await;
        assert_eq!(outcome, AcquireOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn window_rotation_refills_the_budget() {
        let limiter = limiter(2, 60, 0);

        assert!(limiter
            .acquire(Provider::LlmProvider, Duration::ZERO)
            .await
            .is_granted());
        assert!(limiter
            .acquire(Provider::LlmProvider, Duration::ZERO)
            .await
            .is_granted());

        let start = Instant::now();
        let outcome = limiter
            .acquire(Provider::LlmProvider, Duration::from_secs(120))
            .await;
        assert!(outcome.is_granted());
        // The third grant had to wait for the window to rotate.
        assert!(Instant::now() - start >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn min_delay_spaces_consecutive_grants() {
        let limiter = limiter(100, 60, 1000);

        assert!(limiter
            .acquire(Provider::LlmProvider, Duration::from_secs(5))
            .await
            .is_granted());

        let start = Instant::now();
        assert!(limiter
            .acquire(Provider::LlmProvider, Duration::from_secs(5))
            .await
            .is_granted());
        assert!(Instant::now() - start >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_blocks_all_acquires_until_deadline() {
        let limiter = limiter(10, 60, 0);

        limiter.report_limit_hit(Provider::LlmProvider, Duration::from_secs(30));

        let denied = limiter
            .acquire(Provider::LlmProvider, Duration::from_secs(5))
            .await;
        assert_eq!(denied, AcquireOutcome::TimedOut);

        let start = Instant::now();
        let granted = limiter
            .acquire(Provider::LlmProvider, Duration::from_secs(120))
            .await;
        assert!(granted.is_granted());
        // No grant may land before the backoff deadline.
        assert!(Instant::now() - start >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_backoff_restores_window_behavior() {
        let limiter = limiter(5, 60, 0);

        assert!(limiter
            .acquire(Provider::LlmProvider, Duration::ZERO)
            .await
            .is_granted());
        limiter.report_limit_hit(Provider::LlmProvider, Duration::from_secs(100_000));
        limiter.clear_backoff(Provider::LlmProvider);

        // The counter stays saturated, but only until the window rotates.
        let start = Instant::now();
        let outcome = limiter
            .acquire(Provider::LlmProvider, Duration::from_secs(300))
            .await;
        assert!(outcome.is_granted());
        assert!(Instant::now() - start < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_contenders_never_exceed_the_budget() {
        let limiter = std::sync::Arc::new(limiter(3, 60, 0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                limiter
                    .acquire(Provider::LlmProvider, Duration::from_secs(10))
                    .await
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap().is_granted() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_provider_falls_back_to_permissive_default() {
        let limiter = RateLimiter::new(HashMap::new());
        let outcome = limiter.acquire(Provider::Github, Duration::ZERO).await;
        assert!(outcome.is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_remaining_budget_and_backoff() {
        let limiter = limiter(3, 60, 0);

        assert!(limiter
            .acquire(Provider::LlmProvider, Duration::ZERO)
            .await
            .is_granted());

        let stats = limiter.stats(Provider::LlmProvider).unwrap();
        assert_eq!(stats.requests_count, 1);
        assert_eq!(stats.remaining, 2);
        assert!(!stats.is_backed_off);

        limiter.report_limit_hit(Provider::LlmProvider, Duration::from_secs(30));
        let stats = limiter.stats(Provider::LlmProvider).unwrap();
        assert!(stats.is_backed_off);
        assert_eq!(stats.remaining, 0);

        assert!(limiter.stats(Provider::Local).is_none());
        assert_eq!(limiter.all_stats().len(), 1);
    }
}
