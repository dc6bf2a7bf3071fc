//! Wall clock and calendar-day arithmetic.
//!
//! Every day boundary in the engine (streak check-ins, daily task
//! assignment, the same-day flag TTL) is computed by one [`DayClock`]
//! built from the application-wide `timezone_offset_minutes` setting.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

use crate::error::ConfigError;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used for simulations and tests
/// that span several calendar days.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Calendar-day arithmetic in the configured timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayClock {
    offset: FixedOffset,
}

impl DayClock {
    /// Build from a UTC offset in minutes (e.g. `420` for UTC+07:00).
    ///
    /// # Errors
    /// Returns an error if the offset is outside ±24 hours.
    pub fn from_offset_minutes(minutes: i32) -> Result<Self, ConfigError> {
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "timezone_offset_minutes".into(),
                message: format!("{minutes} is not a valid UTC offset"),
            })?;
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local calendar date of `now`.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    pub fn yesterday(&self, now: DateTime<Utc>) -> NaiveDate {
        self.today(now) - Duration::days(1)
    }

    /// Seconds from `now` until the next local midnight. Never zero, so a
    /// TTL derived from it always keeps the key alive for at least a second.
    pub fn seconds_until_midnight(&self, now: DateTime<Utc>) -> u64 {
        let local = now.with_timezone(&self.offset).naive_local();
        let next_midnight = local.date().and_time(NaiveTime::MIN) + Duration::days(1);
        let secs = (next_midnight - local).num_seconds();
        secs.max(1) as u64
    }

    /// Seconds from `now` until the end of the next local day.
    pub fn seconds_until_end_of_tomorrow(&self, now: DateTime<Utc>) -> u64 {
        self.seconds_until_midnight(now) + 86_400
    }
}

impl Default for DayClock {
    fn default() -> Self {
        Self::utc()
    }
}
