//! Injectable time source
//!
//! Every component that reads the wall clock or sleeps does so through
//! [`Clock`], so tests can drive scheduling decisions without real waits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;

/// A source of wall-clock time and timed suspensions.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by `chrono` and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock with a manually controlled now.
///
/// `sleep` advances the clock instead of suspending, so loops that wait on
/// timers run to completion instantly while still observing time moving.
#[derive(Debug)]
pub struct FakeClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or_default();
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Uniform random jitter in `[0, max)`.
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return max;
    }
    let micros = rand::rng().random_range(0..max.as_micros() as u64);
    Duration::from_micros(micros)
}
