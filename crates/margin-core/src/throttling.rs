use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::duration_ms;
use crate::error::ApiError;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Poll interval used while a higher-priority request is waiting.
const MIN_WAIT: Duration = Duration::from_millis(2);

/// Client-side scheduling priority. Higher priorities are admitted first
/// when the rate budget is contended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl RequestPriority {
    const fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

/// What to do with a request that exceeds the rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// Wait until budget is available.
    #[default]
    Queue,
    /// Fail immediately with a rate-limited error.
    Reject,
}

/// At most `max_requests` per rolling `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    pub policy: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            policy: RateLimitPolicy::Queue,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Self::default()
        }
    }

    pub fn rejecting(mut self) -> Self {
        self.policy = RateLimitPolicy::Reject;
        self
    }
}

/// Rate limiter with priority-ordered admission of queued requests.
pub struct RequestScheduler {
    limiter: RwLock<Arc<DirectRateLimiter>>,
    config: RwLock<RateLimitConfig>,
    waiting: Mutex<[usize; 3]>,
    throttled: AtomicU64,
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("config", &self.config())
            .field("waiting", &self.waiting_len())
            .finish()
    }
}

impl RequestScheduler {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: RwLock::new(Arc::new(RateLimiter::direct(quota_from_window(
                config.window,
                config.max_requests,
            )))),
            config: RwLock::new(config),
            waiting: Mutex::new([0; 3]),
            throttled: AtomicU64::new(0),
        }
    }

    /// Replace the limiter. Requests admitted before the call are unaffected.
    pub fn set_rate_limit(&self, config: RateLimitConfig) {
        let limiter = Arc::new(RateLimiter::direct(quota_from_window(
            config.window,
            config.max_requests,
        )));
        *self.limiter.write().unwrap_or_else(PoisonError::into_inner) = limiter;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        debug!(
            max_requests = config.max_requests,
            window_ms = config.window.as_millis() as u64,
            "rate limit reconfigured"
        );
    }

    pub fn config(&self) -> RateLimitConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_waiting(&self) -> MutexGuard<'_, [usize; 3]> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tries to take one unit of budget without waiting. On failure returns
    /// the recommended delay before the next attempt.
    pub fn try_acquire(&self, priority: RequestPriority) -> Result<(), Duration> {
        let waiting = self.lock_waiting();
        let outranked = waiting[priority.index() + 1..].iter().any(|count| *count > 0);
        if outranked {
            return Err(MIN_WAIT);
        }

        let limiter = Arc::clone(&self.limiter.read().unwrap_or_else(PoisonError::into_inner));
        limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    /// Waits for budget according to the configured policy.
    pub async fn acquire(&self, priority: RequestPriority) -> Result<(), ApiError> {
        let mut slot: Option<WaitingSlot<'_>> = None;

        loop {
            let wait = match self.try_acquire(priority) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if slot.is_none() {
                self.throttled.fetch_add(1, Ordering::Relaxed);
                if self.config().policy == RateLimitPolicy::Reject {
                    return Err(ApiError::rate_limited("client rate limit exceeded")
                        .with_retry_after(wait));
                }
                slot = Some(WaitingSlot::register(self, priority));
                debug!(?priority, wait_ms = wait.as_millis() as u64, "request queued by rate limiter");
            }

            tokio::time::sleep(wait.max(MIN_WAIT)).await;
        }
    }

    /// Number of requests currently queued behind the limiter.
    pub fn waiting_len(&self) -> usize {
        self.lock_waiting().iter().sum()
    }

    /// Requests that hit the limiter at least once.
    pub fn throttled_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    pub fn reset_metrics(&self) {
        self.throttled.store(0, Ordering::Relaxed);
    }
}

/// Registration of a queued request; removed on drop so cancelled waiters
/// never block lower priorities.
struct WaitingSlot<'a> {
    scheduler: &'a RequestScheduler,
    priority: RequestPriority,
}

impl<'a> WaitingSlot<'a> {
    fn register(scheduler: &'a RequestScheduler, priority: RequestPriority) -> Self {
        scheduler.lock_waiting()[priority.index()] += 1;
        Self {
            scheduler,
            priority,
        }
    }
}

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        let mut waiting = self.scheduler.lock_waiting();
        let count = &mut waiting[self.priority.index()];
        *count = count.saturating_sub(1);
    }
}

fn quota_from_window(window: Duration, max_requests: u32) -> Quota {
    let burst = NonZeroU32::new(max_requests.max(1)).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (window.as_secs_f64() / f64::from(burst.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}
