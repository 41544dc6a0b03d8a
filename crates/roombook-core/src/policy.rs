//! Daytime restriction policy.
//!
//! Rooms flagged with `restrict_daytime` cannot be booked during the working
//! day. The policy only yields a flag; bookings are never dropped because of
//! it.

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::error::{CoreError, Result};
use crate::room::Room;

/// Default zone the daytime band is evaluated in.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Moscow;

/// Start of the default band, 08:00 local.
pub const DEFAULT_BAND_START: NaiveTime = hms(8, 0, 0);
/// End of the default band, 19:00 local.
pub const DEFAULT_BAND_END: NaiveTime = hms(19, 0, 0);

// Evaluated at compile time, so an invalid literal fails the build.
const fn hms(hour: u32, min: u32, sec: u32) -> NaiveTime {
    match NaiveTime::from_hms_opt(hour, min, sec) {
        Some(time) => time,
        None => panic!("invalid time of day"),
    }
}

/// Weekday daytime band `[band_start, band_end)` in a fixed local zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaytimePolicy {
    timezone: Tz,
    band_start: NaiveTime,
    band_end: NaiveTime,
}

impl Default for DaytimePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEZONE)
    }
}

impl DaytimePolicy {
    /// 08:00 to 19:00 on weekdays in `timezone`.
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            band_start: DEFAULT_BAND_START,
            band_end: DEFAULT_BAND_END,
        }
    }

    /// Builds the policy from an IANA zone name such as `Europe/Moscow`.
    pub fn from_timezone_name(name: &str) -> Result<Self> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| CoreError::UnknownTimezone(name.to_string()))
    }

    #[must_use]
    pub fn with_band(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.band_start = start;
        self.band_end = end;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Returns `true` when `now` falls inside the weekday band.
    pub fn is_restricted_at(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        if local.weekday().num_days_from_monday() >= 5 {
            return false;
        }
        let time = local.time();
        self.band_start <= time && time < self.band_end
    }

    /// Policy flag for `room` evaluated at `now`.
    pub fn restricts(&self, room: &Room, now: DateTime<Utc>) -> bool {
        room.restrict_daytime && self.is_restricted_at(now)
    }
}
