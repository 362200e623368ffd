//! Time source for TTL, retry-window and idle decisions.
//!
//! Every age computation in the crate goes through a [`Clock`] so that expiry
//! can be exercised by advancing a [`ManualClock`] instead of sleeping.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `secs` as a chrono duration, saturating instead of overflowing.
pub fn saturating_seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// `days` as a chrono duration, saturating instead of overflowing.
pub fn saturating_days(days: u64) -> Duration {
    i64::try_from(days)
        .ok()
        .and_then(Duration::try_days)
        .unwrap_or(Duration::MAX)
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::hours(25));
        assert_eq!(clock.now() - start, Duration::hours(25));
    }

    #[test]
    fn test_out_of_range_spans_saturate() {
        assert_eq!(saturating_seconds(90), Duration::seconds(90));
        assert_eq!(saturating_days(7), Duration::days(7));
        assert_eq!(saturating_seconds(u64::MAX), Duration::MAX);
        assert_eq!(saturating_seconds(i64::MAX as u64), Duration::MAX);
        assert_eq!(saturating_days(u64::MAX / 2), Duration::MAX);
    }
}
