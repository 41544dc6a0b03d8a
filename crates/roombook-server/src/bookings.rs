//! Bookings that belong to a person.
//!
//! A booking made through the service account is a meeting in its calendar
//! with the room and the person as attendees. The first attendee that is a
//! configured room decides which room it is; a room that declined holds no
//! booking.

use roombook_core::{RoomRegistry, TimeWindow};
use roombook_protocol::{BookingSource, UserBookingView};
use roombook_providers::{AccountItem, DEFAULT_SUBJECT, ResponseType};
use tracing::{debug, warn};

use crate::my_uni::MyUniBooking;

/// Reads a service-account item as a room booking.
///
/// `None` when no attendee is a known room, or the room declined.
pub fn exchange_booking(registry: &RoomRegistry, item: &AccountItem) -> Option<UserBookingView> {
    let (room, room_attendee) = item.attendees.iter().find_map(|attendee| {
        registry
            .by_resource(&attendee.email)
            .map(|room| (room, attendee))
    })?;
    if room_attendee.response == ResponseType::Decline {
        debug!(item_id = %item.item_id, room_id = %room.id, "room declined the meeting");
        return None;
    }
    if item.start >= item.end {
        warn!(item_id = %item.item_id, "calendar item with empty interval, skipping");
        return None;
    }

    let attendees = item
        .attendees
        .iter()
        .filter(|a| registry.by_resource(&a.email).is_none())
        .map(|a| a.email.clone())
        .collect();
    Some(UserBookingView {
        id: item.item_id.clone(),
        source: BookingSource::Exchange,
        room_id: room.id.clone(),
        title: item
            .subject
            .clone()
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
        start: item.start,
        end: item.end,
        attendees,
    })
}

/// Service-account bookings that list `email` as an attendee.
pub fn exchange_bookings_of(
    registry: &RoomRegistry,
    items: &[AccountItem],
    email: &str,
) -> Vec<UserBookingView> {
    items
        .iter()
        .filter(|item| item.attendee(email).is_some())
        .filter_map(|item| exchange_booking(registry, item))
        .collect()
}

/// My University bookings inside `window`, mapped onto configured rooms.
pub fn my_uni_bookings(
    registry: &RoomRegistry,
    bookings: Vec<MyUniBooking>,
    window: &TimeWindow,
) -> Vec<UserBookingView> {
    bookings
        .into_iter()
        .filter(|b| b.start < window.end && window.start < b.end)
        .filter_map(|b| {
            let Some(room) = registry.by_my_uni_id(b.room) else {
                warn!(booking = %b.id, my_uni_room = b.room, "my university booking for unknown room");
                return None;
            };
            Some(UserBookingView {
                id: b.id,
                source: BookingSource::MyUni,
                room_id: room.id.clone(),
                title: b.title,
                start: b.start,
                end: b.end,
                attendees: Vec::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use roombook_core::RoomSpec;
    use roombook_providers::Attendee;

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap()
    }

    fn registry() -> RoomRegistry {
        RoomRegistry::load([
            RoomSpec::mailbox("301", "Lecture 301", "301", "r301@uni.example").with_my_uni_id(12),
            RoomSpec::mailbox("302", "Lecture 302", "302", "r302@uni.example"),
        ])
        .unwrap()
    }

    fn item(id: &str, attendees: &[(&str, ResponseType)]) -> AccountItem {
        AccountItem {
            item_id: id.to_string(),
            subject: None,
            start: utc(3, 9),
            end: utc(3, 10),
            attendees: attendees
                .iter()
                .map(|(email, response)| Attendee::new(*email, *response))
                .collect(),
        }
    }

    #[test]
    fn first_room_attendee_decides_the_room() {
        let booking = exchange_booking(
            &registry(),
            &item(
                "A1",
                &[
                    ("s.student@uni.example", ResponseType::Accept),
                    ("R302@uni.example", ResponseType::Accept),
                    ("r301@uni.example", ResponseType::Accept),
                ],
            ),
        )
        .unwrap();
        assert_eq!(booking.room_id, "302");
        assert_eq!(booking.title, DEFAULT_SUBJECT);
        assert_eq!(booking.attendees, vec!["s.student@uni.example"]);
        assert_eq!(booking.source, BookingSource::Exchange);
    }

    #[test]
    fn declined_or_roomless_items_are_not_bookings() {
        let registry = registry();
        let declined = item(
            "A1",
            &[
                ("r301@uni.example", ResponseType::Decline),
                ("s.student@uni.example", ResponseType::Accept),
            ],
        );
        assert!(exchange_booking(&registry, &declined).is_none());

        let roomless = item("A2", &[("s.student@uni.example", ResponseType::Accept)]);
        assert!(exchange_booking(&registry, &roomless).is_none());
    }

    #[test]
    fn only_the_callers_items_are_kept() {
        let items = vec![
            item(
                "mine",
                &[
                    ("r301@uni.example", ResponseType::Accept),
                    ("S.Student@uni.example", ResponseType::Accept),
                ],
            ),
            item(
                "theirs",
                &[
                    ("r301@uni.example", ResponseType::Accept),
                    ("other@uni.example", ResponseType::Accept),
                ],
            ),
        ];
        let bookings = exchange_bookings_of(&registry(), &items, "s.student@uni.example");
        let ids: Vec<_> = bookings.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["mine"]);
    }

    #[test]
    fn my_uni_bookings_map_rooms_and_window() {
        let booking = |id: &str, room, day| MyUniBooking {
            id: id.to_string(),
            room,
            title: "Club".into(),
            start: utc(day, 18),
            end: utc(day, 20),
        };
        let window = TimeWindow::new(utc(3, 0), utc(4, 0));
        let bookings = my_uni_bookings(
            &registry(),
            vec![booking("1", 12, 3), booking("2", 99, 3), booking("3", 12, 9)],
            &window,
        );
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].id, "1");
        assert_eq!(bookings[0].room_id, "301");
        assert_eq!(bookings[0].source, BookingSource::MyUni);
    }
}
