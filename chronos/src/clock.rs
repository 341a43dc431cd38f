//! Time source for the limiter and the engine.
//!
//! Every timed wait goes through [`Clock::sleep`], so tests can substitute a
//! virtual clock and assert exact wait durations without real delays.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub trait Clock: Send + Sync {
    /// Monotonic time.
    fn now(&self) -> Instant;
    /// Wall-clock time for persisted timestamps.
    fn wall_now(&self) -> DateTime<Utc>;
    /// Suspend for `duration`. Callers race this against cancellation.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Real time, sleeping on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}
