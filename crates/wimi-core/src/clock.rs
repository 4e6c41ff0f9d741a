use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of wall-clock time for deadline and window comparisons.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Longest span [`Duration::seconds`] accepts.
const MAX_SPAN_SECS: i64 = i64::MAX / 1000;

/// A span of `secs` seconds, clamped to the longest span chrono can hold.
pub fn span_secs(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).map_or(MAX_SPAN_SECS, |s| s.min(MAX_SPAN_SECS)))
}

/// `at + span`, saturating at the latest representable instant.
pub fn deadline_after(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    at.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Manually advanced clock, used to drive expiry and rolling windows in tests
/// and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start the clock at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
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
        clock.advance(Duration::minutes(31));
        assert_eq!(clock.now(), start + Duration::minutes(31));
    }

    #[test]
    fn test_huge_spans_saturate() {
        assert_eq!(span_secs(90), Duration::seconds(90));
        assert_eq!(span_secs(u64::MAX), span_secs(i64::MAX as u64));
        let now = Utc::now();
        assert_eq!(deadline_after(now, span_secs(u64::MAX)), DateTime::<Utc>::MAX_UTC);
        assert!(now - DateTime::<Utc>::MIN_UTC < span_secs(u64::MAX));
    }
}
