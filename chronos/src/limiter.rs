//! Token bucket admission control for requests to the wrapped tool.
//!
//! Every turn passes through [`RateLimiter::acquire`]. The limiter never
//! rejects a request; it only delays it. A quota rejection reported by the
//! remote side overrides the local estimate through [`RateLimiter::penalize`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::core::bucket::BucketState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    #[error("wait for quota cancelled")]
    Cancelled,
    #[error("request cost {cost} exceeds bucket capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: u32 },
}

/// Limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl Default for LimiterConfig {
    /// 60 requests per minute with a burst of 60.
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_per_second: 1.0,
        }
    }
}

pub struct RateLimiter {
    capacity: u32,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let state = BucketState::new(config.capacity, config.refill_per_second, clock.now());
        Self {
            capacity: config.capacity,
            state: Mutex::new(state),
            clock,
        }
    }

    /// Wait until `cost` credits are available, then take them.
    ///
    /// Returns the total time spent waiting.
    #[instrument(skip_all, fields(cost = cost))]
    pub async fn acquire(
        &self,
        cost: u32,
        cancel: &CancellationToken,
    ) -> Result<Duration, LimiterError> {
        if cost > self.capacity {
            return Err(LimiterError::CostExceedsCapacity {
                cost,
                capacity: self.capacity,
            });
        }
        let mut waited = Duration::ZERO;
        loop {
            if cancel.is_cancelled() {
                return Err(LimiterError::Cancelled);
            }
            // The guard is dropped before any await.
            let wait = {
                let now = self.clock.now();
                match self.lock().try_take(f64::from(cost), now) {
                    Ok(()) => {
                        debug!(waited_ms = waited.as_millis() as u64, "admission granted");
                        return Ok(waited);
                    }
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "waiting for quota");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LimiterError::Cancelled),
                _ = self.clock.sleep(wait) => {}
            }
            waited += wait;
        }
    }

    /// Apply an authoritative quota rejection: no credits until `retry_after`
    /// has elapsed.
    pub fn penalize(&self, retry_after: Duration) {
        let now = self.clock.now();
        self.lock().penalize(now, retry_after);
        info!(retry_after_secs = retry_after.as_secs_f64(), "limiter penalized by remote rejection");
    }

    pub fn snapshot(&self) -> BucketState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    fn limiter(clock: &Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(LimiterConfig::default(), clock.clone())
    }

    #[tokio::test]
    async fn burst_of_capacity_is_immediate_then_one_second_per_credit() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);
        let cancel = CancellationToken::new();

        for _ in 0..60 {
            let waited = limiter.acquire(1, &cancel).await.expect("grant");
            assert_eq!(waited, Duration::ZERO);
        }
        assert!(clock.sleeps().is_empty());

        let waited = limiter.acquire(1, &cancel).await.expect("grant");
        assert_eq!(waited, Duration::from_secs(1));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn empty_bucket_waits_exactly_one_refill_interval() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(
            LimiterConfig {
                capacity: 10,
                refill_per_second: 0.5,
            },
            clock.clone(),
        );
        let cancel = CancellationToken::new();
        for _ in 0..10 {
            limiter.acquire(1, &cancel).await.expect("grant");
        }
        let waited = limiter.acquire(1, &cancel).await.expect("grant");
        assert_eq!(waited, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn penalty_blocks_next_acquire_for_at_least_retry_after() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);
        let cancel = CancellationToken::new();

        limiter.penalize(Duration::from_secs(45));
        let waited = limiter.acquire(1, &cancel).await.expect("grant");
        assert!(waited >= Duration::from_secs(45), "waited {waited:?}");
        assert_eq!(waited, Duration::from_secs(46));
    }

    #[tokio::test]
    async fn grants_never_exceed_burst_plus_refill() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);
        let cancel = CancellationToken::new();
        let start = clock.now();

        let mut grant_times = Vec::new();
        for _ in 0..200 {
            limiter.acquire(1, &cancel).await.expect("grant");
            grant_times.push(clock.now().duration_since(start));
        }

        // Any 60s window holds at most capacity + 60 * rate grants, and a window
        // that starts once the burst is spent holds at most 60.
        for (i, t) in grant_times.iter().enumerate() {
            let in_window = grant_times[i..]
                .iter()
                .take_while(|g| **g < *t + Duration::from_secs(60))
                .count();
            assert!(in_window <= 120, "window at {t:?} had {in_window}");
            if *t >= Duration::from_secs(1) {
                assert!(in_window <= 60, "window at {t:?} had {in_window}");
            }
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);
        let cancel = CancellationToken::new();
        limiter.penalize(Duration::from_secs(3600));
        cancel.cancel();

        let err = limiter.acquire(1, &cancel).await.unwrap_err();
        assert_eq!(err, LimiterError::Cancelled);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn cost_above_capacity_is_rejected() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(&clock);
        let err = limiter
            .acquire(61, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LimiterError::CostExceedsCapacity {
                cost: 61,
                capacity: 60
            }
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_bucket() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig {
                capacity: 5,
                refill_per_second: 1.0,
            },
            clock.clone(),
        ));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(1, &cancel).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Ok(Duration::ZERO));
        }
        assert!(limiter.snapshot().available < 1.0);
    }
}
