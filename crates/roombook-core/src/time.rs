//! Query windows and minute snapping.
//!
//! A [`TimeWindow`] is the query horizon for one availability lookup. Cache
//! keys are built from windows snapped to whole minutes so that requests
//! issued a few seconds apart land on the same entry.

use chrono::{DateTime, Duration, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A closed time window `[start, end]` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start of the window.
    pub start: DateTime<Utc>,
    /// End of the window.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a new time window.
    ///
    /// # Panics
    ///
    /// Panics if `start` is after `end`. Use [`TimeWindow::try_new`] for
    /// untrusted input.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start <= end, "TimeWindow start must be <= end");
        Self { start, end }
    }

    /// Creates a window, rejecting `start > end`.
    pub fn try_new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(CoreError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a window starting at `now` and extending `duration`.
    pub fn from_now(now: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(now, now + duration)
    }

    /// Returns the duration of this window.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Returns `true` when `dt` lies in `[start, end)`.
    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }

    /// Checks whether the interval `[start, end)` overlaps this window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }

    /// Truncates `[start, end)` to the window bounds.
    ///
    /// Returns `None` when nothing of the interval remains.
    pub fn clip(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.overlaps(start, end) {
            return None;
        }
        let (start, end) = (start.max(self.start), end.min(self.end));
        (start < end).then_some((start, end))
    }

    /// Widens the window to whole minutes: start floored, end ceiled.
    pub fn snapped(&self) -> Self {
        Self {
            start: floor_to_minute(self.start),
            end: ceil_to_minute(self.end),
        }
    }
}

/// Rounds down to the start of the minute.
pub fn floor_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(TimeDelta::minutes(1)).unwrap_or(dt)
}

/// Rounds up to the next whole minute; whole minutes are unchanged.
pub fn ceil_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    let floored = floor_to_minute(dt);
    if floored == dt {
        dt
    } else {
        floored + TimeDelta::minutes(1)
    }
}
