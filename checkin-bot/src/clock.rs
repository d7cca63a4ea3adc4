//! Time sources for period boundaries and backoff waits
//!
//! The engine never reads the system clock or sleeps directly; it goes
//! through [`Clock`] and [`Delay`] so tests can move across day boundaries
//! and skip backoff waits.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Timelike, Utc};
use std::time::Duration;

/// Width of one check-in slot
pub const SLOT_MINUTES: u32 = 12;

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Waits out a backoff delay
#[async_trait]
pub trait Delay: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real waiting on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Maps instants onto idempotency periods (calendar days in a fixed offset)
#[derive(Debug, Clone, Copy)]
pub struct PeriodCalendar {
    offset: FixedOffset,
}

impl PeriodCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Period key for an instant, formatted `YYYY-MM-DD`
    pub fn period_of(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.offset)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Hour of day (0-23) in the configured offset
    pub fn local_hour(&self, instant: DateTime<Utc>) -> u32 {
        instant.with_timezone(&self.offset).hour()
    }

    /// Local `(hour, slot)` of an instant; each hour holds five 12-minute slots
    pub fn slot_of(&self, instant: DateTime<Utc>) -> (u32, u32) {
        let local = instant.with_timezone(&self.offset);
        (local.hour(), local.minute() / SLOT_MINUTES)
    }
}
