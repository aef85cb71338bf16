//! Wall-clock access and daily reset boundaries.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> DateTime<Local>;
}

/// The host clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Local>>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock() = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock()
    }
}

/// Resolve a local date and time, picking the earlier instant across DST folds.
#[must_use]
pub fn local_at(date: NaiveDate, time: NaiveTime) -> DateTime<Local> {
    let naive = date.and_time(time);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

/// Today's occurrence of `reset_time`.
#[must_use]
pub fn reset_time_today(now: DateTime<Local>, reset_time: NaiveTime) -> DateTime<Local> {
    local_at(now.date_naive(), reset_time)
}

/// Most recent occurrence of `reset_time` at or before `now`.
#[must_use]
pub fn last_reset_boundary(now: DateTime<Local>, reset_time: NaiveTime) -> DateTime<Local> {
    let today = reset_time_today(now, reset_time);
    if now < today {
        today - ChronoDuration::days(1)
    } else {
        today
    }
}

/// Serde adapter for `"HH:MM"` time-of-day strings.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Parse `"H:MM"`/`"HH:MM"`, also accepting a seconds suffix.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error for malformed input.
    pub fn parse(s: &str) -> Result<NaiveTime, chrono::ParseError> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M").or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
    }

    /// Serialize as `"HH:MM"`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&time.format("%H:%M"))
    }

    /// Deserialize from `"HH:MM"`.
    ///
    /// # Errors
    ///
    /// Returns a custom error for malformed times.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_boundary_after_reset_time() {
        let six = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert_eq!(last_reset_boundary(at(10, 0), six), at(6, 0));
    }

    #[test]
    fn test_boundary_before_reset_time() {
        let six = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let boundary = last_reset_boundary(at(5, 59), six);
        assert_eq!(boundary, Local.with_ymd_and_hms(2024, 6, 14, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_hhmm_parse() {
        assert_eq!(hhmm::parse("6:05").unwrap(), NaiveTime::from_hms_opt(6, 5, 0).unwrap());
        assert_eq!(hhmm::parse("23:00:00").unwrap(), NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert!(hhmm::parse("25:00").is_err());
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(at(10, 0));
        clock.advance(ChronoDuration::minutes(30));
        assert_eq!(clock.now(), at(10, 30));
    }
}
