//! Meetings in the service account's own calendar.
//!
//! Bookings made through the service account show up there with the room
//! and the person who booked it as attendees. Unlike the free/busy view,
//! these items carry attendee lists and stable item ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an attendee answered the meeting request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Unknown,
    Organizer,
    Tentative,
    Accept,
    Decline,
    NoResponseReceived,
}

impl ResponseType {
    /// Parses EWS `ResponseType` values. Unknown values map to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "Organizer" => Self::Organizer,
            "Tentative" => Self::Tentative,
            "Accept" => Self::Accept,
            "Decline" => Self::Decline,
            "NoResponseReceived" => Self::NoResponseReceived,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    pub response: ResponseType,
}

impl Attendee {
    pub fn new(email: impl Into<String>, response: ResponseType) -> Self {
        Self {
            email: email.into(),
            response,
        }
    }
}

/// One calendar item of the service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountItem {
    pub item_id: String,
    pub subject: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<Attendee>,
}

impl AccountItem {
    /// Finds an attendee by email, ignoring case.
    pub fn attendee(&self, email: &str) -> Option<&Attendee> {
        self.attendees
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email.trim()))
    }
}
