//! RawEvent to AvailabilityWindow conversion.
//!
//! The pipeline:
//! 1. Drops entries whose busy status leaves the room open
//! 2. Resolves times to UTC, placing all-day dates at local midnight
//! 3. Clips every interval to the query window
//! 4. Merges overlapping and touching intervals into single bookings
//! 5. Evaluates the daytime policy at `now`
//!
//! [`normalize`] is a pure function of its arguments.

use chrono::{DateTime, Utc};
use roombook_core::{AvailabilityWindow, Booking, DaytimePolicy, Room, TimeWindow};

use crate::raw_event::{RawEvent, RawEventTime};

/// Label used when upstream gives no subject.
pub const DEFAULT_SUBJECT: &str = "Busy";

/// Builds the availability of `room` over `window` from raw upstream entries.
pub fn normalize(
    raw_events: &[RawEvent],
    room: &Room,
    window: &TimeWindow,
    now: DateTime<Utc>,
    policy: &DaytimePolicy,
) -> AvailabilityWindow {
    let tz = policy.timezone();
    let mut intervals: Vec<Booking> = raw_events
        .iter()
        .filter(|raw| raw.busy_status.is_blocking())
        .filter_map(|raw| {
            let start = raw.start.resolve(&tz)?;
            let end = raw.end.resolve(&tz)?;
            if start >= end {
                tracing::debug!(room_id = %room.id, %start, %end, "skipping empty interval");
                return None;
            }
            // An empty window clips everything to nothing.
            let (start, end) = window.clip(start, end)?;
            let subject = raw
                .subject
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_SUBJECT);
            Some(Booking::new(&room.id, start, end, subject))
        })
        .collect();

    intervals.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.end.cmp(&b.end))
            .then_with(|| a.subject.cmp(&b.subject))
    });

    let bookings = merge_overlapping(intervals);
    tracing::trace!(
        room_id = %room.id,
        raw = raw_events.len(),
        bookings = bookings.len(),
        "normalized upstream entries"
    );

    AvailabilityWindow {
        room_id: room.id.clone(),
        query_start: window.start,
        query_end: window.end,
        bookings,
        fetched_at: now,
        policy_restricted: policy.restricts(room, now),
    }
}

/// Merges a start-sorted sequence so that no two bookings overlap or touch.
///
/// Distinct subjects of merged entries are joined with `"; "`.
pub fn merge_overlapping(sorted: Vec<Booking>) -> Vec<Booking> {
    let mut merged: Vec<(Booking, Vec<String>)> = Vec::with_capacity(sorted.len());
    for booking in sorted {
        if let Some((last, subjects)) = merged.last_mut() {
            if booking.start <= last.end {
                last.end = last.end.max(booking.end);
                if !subjects.contains(&booking.subject) {
                    subjects.push(booking.subject);
                }
                continue;
            }
        }
        let subjects = vec![booking.subject.clone()];
        merged.push((booking, subjects));
    }
    merged
        .into_iter()
        .map(|(mut booking, subjects)| {
            booking.subject = subjects.join("; ");
            booking
        })
        .collect()
}

impl From<&Booking> for RawEvent {
    fn from(booking: &Booking) -> Self {
        RawEvent::new(
            RawEventTime::DateTime(booking.start),
            RawEventTime::DateTime(booking.end),
        )
        .with_subject(&booking.subject)
    }
}
