//! Token bucket arithmetic.
//!
//! Refill is lazy: credits accrue as `elapsed * refill_per_second` at the moment
//! of each acquisition attempt, clamped to `capacity`. `last_refill` may lie in
//! the future after an external rate-limit signal; until that instant no
//! credits accrue.

use std::time::{Duration, Instant};

/// Longest refill deferral a single rejection can impose.
pub const MAX_PENALTY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct BucketState {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub available: f64,
    pub last_refill: Instant,
}

impl BucketState {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_second,
            available: f64::from(capacity),
            last_refill: now,
        }
    }

    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then take `cost` credits if available.
    ///
    /// On shortfall returns the minimum wait after which `cost` credits will
    /// have accrued, including any time until a future `last_refill`.
    pub fn try_take(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.available >= cost {
            self.available -= cost;
            return Ok(());
        }
        let deficit = cost - self.available;
        let blocked = self.last_refill.saturating_duration_since(now);
        Err(blocked + Duration::from_secs_f64(deficit / self.refill_per_second))
    }

    /// Authoritative quota rejection: empty the bucket and defer refill by
    /// `retry_after`, capped at [`MAX_PENALTY`].
    pub fn penalize(&mut self, now: Instant, retry_after: Duration) {
        self.available = 0.0;
        let deferred = retry_after.min(MAX_PENALTY);
        self.last_refill = now
            .checked_add(deferred)
            .or_else(|| now.checked_add(MAX_PENALTY))
            .unwrap_or(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let t0 = Instant::now();
        let mut bucket = BucketState::new(3, 1.0, t0);
        for _ in 0..3 {
            assert_eq!(bucket.try_take(1.0, t0), Ok(()));
        }
        assert_eq!(bucket.try_take(1.0, t0), Err(Duration::from_secs(1)));
    }

    #[test]
    fn refill_is_clamped_to_capacity() {
        let t0 = Instant::now();
        let mut bucket = BucketState::new(60, 1.0, t0);
        bucket.available = 10.0;
        bucket.refill(t0 + Duration::from_secs(3600));
        assert_eq!(bucket.available, 60.0);
    }

    #[test]
    fn partial_credit_shortens_wait() {
        let t0 = Instant::now();
        let mut bucket = BucketState::new(60, 1.0, t0);
        bucket.available = 0.0;
        let wait = bucket
            .try_take(1.0, t0 + Duration::from_millis(250))
            .expect_err("should wait");
        assert_eq!(wait, Duration::from_millis(750));
    }

    #[test]
    fn penalty_blocks_until_retry_after_plus_one_credit() {
        let t0 = Instant::now();
        let mut bucket = BucketState::new(60, 1.0, t0);
        bucket.penalize(t0, Duration::from_secs(30));

        let wait = bucket.try_take(1.0, t0).expect_err("should wait");
        assert_eq!(wait, Duration::from_secs(31));

        // No credits accrue before the penalty expires.
        bucket.refill(t0 + Duration::from_secs(10));
        assert_eq!(bucket.available, 0.0);
        assert_eq!(bucket.last_refill, t0 + Duration::from_secs(30));

        assert_eq!(bucket.try_take(1.0, t0 + Duration::from_secs(31)), Ok(()));
    }

    #[test]
    fn oversized_penalty_is_capped() {
        let t0 = Instant::now();
        let mut bucket = BucketState::new(60, 1.0, t0);
        bucket.penalize(t0, Duration::MAX);
        assert_eq!(bucket.last_refill, t0 + MAX_PENALTY);
        assert_eq!(
            bucket.try_take(1.0, t0),
            Err(MAX_PENALTY + Duration::from_secs(1))
        );
    }

    #[test]
    fn faster_refill_rate_shortens_wait() {
        let t0 = Instant::now();
        let mut bucket = BucketState::new(120, 2.0, t0);
        bucket.available = 0.0;
        assert_eq!(
            bucket.try_take(1.0, t0),
            Err(Duration::from_millis(500))
        );
    }
}
