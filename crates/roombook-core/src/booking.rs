//! Canonical bookings and the per-room availability window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::TimeWindow;

/// A single reserved interval `[start, end)` of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub room_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Opaque label; upstream may redact it.
    pub subject: String,
}

impl Booking {
    /// Creates a booking.
    ///
    /// # Panics
    ///
    /// Panics unless `start < end`.
    pub fn new(
        room_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        subject: impl Into<String>,
    ) -> Self {
        assert!(start < end, "Booking start must be < end");
        Self {
            room_id: room_id.into(),
            start,
            end,
            subject: subject.into(),
        }
    }

    /// Stable identifier derived from the room and the interval bounds.
    pub fn id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.room_id,
            self.start.timestamp(),
            self.end.timestamp()
        )
    }

    /// Splits an id produced by [`Booking::id`] into room id and bounds.
    ///
    /// Room ids may contain `-`; the bounds are the last two segments.
    pub fn parse_id(id: &str) -> Option<(&str, DateTime<Utc>, DateTime<Utc>)> {
        let mut parts = id.rsplitn(3, '-');
        let end = parts.next()?.parse::<i64>().ok()?;
        let start = parts.next()?.parse::<i64>().ok()?;
        let room_id = parts.next().filter(|r| !r.is_empty())?;
        let start = DateTime::from_timestamp(start, 0)?;
        let end = DateTime::from_timestamp(end, 0)?;
        (start < end).then_some((room_id, start, end))
    }

    /// `a.start < b.end && b.start < a.end`
    pub fn overlaps(&self, other: &Booking) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }
}

/// Availability of one room over one query window.
///
/// `bookings` are sorted by start and never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub room_id: String,
    pub query_start: DateTime<Utc>,
    pub query_end: DateTime<Utc>,
    pub bookings: Vec<Booking>,
    pub fetched_at: DateTime<Utc>,
    /// The room is not bookable right now because of its daytime policy.
    /// Bookings are reported regardless.
    pub policy_restricted: bool,
}

impl AvailabilityWindow {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.query_start, self.query_end)
    }

    /// Returns the booking occupying `dt`, if any.
    pub fn booking_at(&self, dt: DateTime<Utc>) -> Option<&Booking> {
        // Sorted and disjoint, so the candidate is the last one starting at or before dt.
        let idx = self.bookings.partition_point(|b| b.start <= dt);
        idx.checked_sub(1)
            .map(|i| &self.bookings[i])
            .filter(|b| b.contains(dt))
    }

    pub fn is_busy_at(&self, dt: DateTime<Utc>) -> bool {
        self.booking_at(dt).is_some()
    }

    /// Gaps between bookings inside the query window.
    pub fn free_slots(&self) -> Vec<TimeWindow> {
        let mut slots = Vec::new();
        let mut cursor = self.query_start;
        for booking in &self.bookings {
            if booking.start > cursor {
                slots.push(TimeWindow::new(cursor, booking.start));
            }
            cursor = cursor.max(booking.end);
        }
        if cursor < self.query_end {
            slots.push(TimeWindow::new(cursor, self.query_end));
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn window_with(bookings: Vec<Booking>) -> AvailabilityWindow {
        AvailabilityWindow {
            room_id: "301".to_string(),
            query_start: utc(2025, 3, 3, 8, 0, 0),
            query_end: utc(2025, 3, 3, 12, 0, 0),
            bookings,
            fetched_at: utc(2025, 3, 3, 7, 0, 0),
            policy_restricted: false,
        }
    }

    #[test]
    fn id_is_derived_from_room_and_bounds() {
        let booking = Booking::new(
            "301",
            utc(2025, 3, 3, 9, 0, 0),
            utc(2025, 3, 3, 10, 0, 0),
            "Seminar",
        );
        assert_eq!(booking.id(), "301-1740992400-1740996000");
    }

    #[test]
    fn parse_id_reverses_id() {
        let booking = Booking::new(
            "lab-a",
            utc(2025, 3, 3, 9, 0, 0),
            utc(2025, 3, 3, 10, 0, 0),
            "Seminar",
        );
        let id = booking.id();
        assert_eq!(
            Booking::parse_id(&id),
            Some(("lab-a", booking.start, booking.end))
        );

        assert_eq!(Booking::parse_id("301-1740996000-1740992400"), None);
        assert_eq!(Booking::parse_id("-1740992400-1740996000"), None);
        assert_eq!(Booking::parse_id("301-x-1740996000"), None);
        assert_eq!(Booking::parse_id("AAMkAGI2TG93AAA="), None);
    }

    #[test]
    #[should_panic(expected = "start must be < end")]
    fn new_rejects_empty_interval() {
        let at = utc(2025, 3, 3, 9, 0, 0);
        Booking::new("301", at, at, "x");
    }

    #[test]
    fn overlap_is_strict() {
        let a = Booking::new("r", utc(2025, 3, 3, 9, 0, 0), utc(2025, 3, 3, 10, 0, 0), "a");
        let b = Booking::new("r", utc(2025, 3, 3, 9, 30, 0), utc(2025, 3, 3, 11, 0, 0), "b");
        let c = Booking::new("r", utc(2025, 3, 3, 10, 0, 0), utc(2025, 3, 3, 11, 0, 0), "c");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn booking_at_finds_occupying_interval() {
        let window = window_with(vec![
            Booking::new("301", utc(2025, 3, 3, 9, 0, 0), utc(2025, 3, 3, 10, 0, 0), "a"),
            Booking::new("301", utc(2025, 3, 3, 11, 0, 0), utc(2025, 3, 3, 11, 30, 0), "b"),
        ]);
        assert_eq!(window.booking_at(utc(2025, 3, 3, 9, 30, 0)).unwrap().subject, "a");
        assert!(window.booking_at(utc(2025, 3, 3, 10, 0, 0)).is_none());
        assert!(window.is_busy_at(utc(2025, 3, 3, 11, 0, 0)));
        assert!(!window.is_busy_at(utc(2025, 3, 3, 8, 0, 0)));
    }

    #[test]
    fn free_slots_fill_gaps() {
        let window = window_with(vec![
            Booking::new("301", utc(2025, 3, 3, 8, 0, 0), utc(2025, 3, 3, 9, 0, 0), "a"),
            Booking::new("301", utc(2025, 3, 3, 10, 0, 0), utc(2025, 3, 3, 11, 0, 0), "b"),
        ]);
        assert_eq!(
            window.free_slots(),
            vec![
                TimeWindow::new(utc(2025, 3, 3, 9, 0, 0), utc(2025, 3, 3, 10, 0, 0)),
                TimeWindow::new(utc(2025, 3, 3, 11, 0, 0), utc(2025, 3, 3, 12, 0, 0)),
            ]
        );
    }

    #[test]
    fn free_slots_of_empty_window_is_whole_window() {
        let window = window_with(vec![]);
        assert_eq!(window.free_slots(), vec![window.window()]);
    }
}
