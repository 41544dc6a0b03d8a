//! Busy-time entries as read from the upstream, before normalization.
//!
//! Both the EWS free/busy view and ICS feeds are decoded into [`RawEvent`]
//! right at the fetcher boundary, so nothing downstream sees SOAP or
//! iCalendar structures.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Start or end of a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum RawEventTime {
    DateTime(DateTime<Utc>),
    /// Date without time; all-day entries.
    Date(NaiveDate),
}

impl RawEventTime {
    pub fn is_all_day(&self) -> bool {
        matches!(self, Self::Date(_))
    }

    /// Resolves to an instant, placing dates at local midnight in `tz`.
    pub fn resolve<Tz: TimeZone>(&self, tz: &Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            Self::Date(date) => tz
                .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Free/busy classification reported by Exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyStatus {
    Free,
    Tentative,
    #[default]
    Busy,
    OutOfOffice,
    WorkingElsewhere,
    NoData,
}

impl BusyStatus {
    /// Parses EWS `BusyType` and `X-MICROSOFT-CDO-BUSYSTATUS` values.
    ///
    /// Unknown values count as busy.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "tentative" => Self::Tentative,
            "oof" | "outofoffice" => Self::OutOfOffice,
            "workingelsewhere" => Self::WorkingElsewhere,
            "nodata" => Self::NoData,
            _ => Self::Busy,
        }
    }

    /// Whether this status occupies the room.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Free | Self::NoData)
    }
}

/// A single busy entry from the upstream calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Upstream identifier, when the source exposes one.
    pub uid: Option<String>,
    pub start: RawEventTime,
    pub end: RawEventTime,
    pub subject: Option<String>,
    pub organizer: Option<String>,
    pub busy_status: BusyStatus,
}

impl RawEvent {
    pub fn new(start: RawEventTime, end: RawEventTime) -> Self {
        Self {
            uid: None,
            start,
            end,
            subject: None,
            organizer: None,
            busy_status: BusyStatus::Busy,
        }
    }

    /// Busy entry between two instants.
    pub fn busy(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(RawEventTime::DateTime(start), RawEventTime::DateTime(end))
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn with_organizer(mut self, organizer: impl Into<String>) -> Self {
        self.organizer = Some(organizer.into());
        self
    }

    #[must_use]
    pub fn with_busy_status(mut self, status: BusyStatus) -> Self {
        self.busy_status = status;
        self
    }
}
