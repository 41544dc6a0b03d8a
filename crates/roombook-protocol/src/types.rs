//! Request and response types of the availability API.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use roombook_core::{AccessLevel, AvailabilityWindow, Booking, Room, TimeWindow, floor_to_minute};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{DEFAULT_WINDOW_DAYS, MAX_WINDOW_DAYS};

/// Query string of `GET /bookings/availability`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    /// Comma-separated room ids, or `all`. Omitted means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_ids: Option<String>,

    /// RFC 3339 start of the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// RFC 3339 end of the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    /// Whether "all" includes red-access rooms.
    #[serde(default)]
    pub include_red: bool,
}

/// Which rooms a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomSelection {
    All { include_red: bool },
    /// Explicit ids, duplicates removed, request order kept.
    Ids(Vec<String>),
}

impl AvailabilityQuery {
    /// Builder: request specific rooms.
    pub fn for_rooms<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self {
            room_ids: Some(ids.join(",")),
            ..Self::default()
        }
    }

    /// Builder: set the window bounds.
    #[must_use]
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start.to_rfc3339());
        self.end = Some(end.to_rfc3339());
        self
    }

    /// Builder: include red rooms in "all".
    #[must_use]
    pub fn include_red(mut self, include: bool) -> Self {
        self.include_red = include;
        self
    }

    /// Interprets `room_ids`.
    pub fn selection(&self) -> ProtocolResult<RoomSelection> {
        let raw = match self.room_ids.as_deref().map(str::trim) {
            None => {
                return Ok(RoomSelection::All {
                    include_red: self.include_red,
                });
            }
            Some(raw) if raw.eq_ignore_ascii_case("all") => {
                return Ok(RoomSelection::All {
                    include_red: self.include_red,
                });
            }
            Some(raw) => raw,
        };

        let mut ids: Vec<String> = Vec::new();
        for id in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            return Err(ProtocolError::EmptyRoomList);
        }
        Ok(RoomSelection::Ids(ids))
    }

    /// Resolves the query window against `now`.
    ///
    /// A missing start is the current minute; a missing end is
    /// [`DEFAULT_WINDOW_DAYS`] after the start.
    pub fn window(&self, now: DateTime<Utc>) -> ProtocolResult<TimeWindow> {
        let start = match self.start.as_deref() {
            Some(value) => parse_instant("start", value)?,
            None => floor_to_minute(now),
        };
        let end = match self.end.as_deref() {
            Some(value) => parse_instant("end", value)?,
            None => start + Duration::days(DEFAULT_WINDOW_DAYS),
        };

        if start > end {
            return Err(ProtocolError::InvertedWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        if end - start > Duration::days(MAX_WINDOW_DAYS) {
            return Err(ProtocolError::WindowTooLong {
                days: (end - start).num_days(),
                max: MAX_WINDOW_DAYS,
            });
        }
        Ok(TimeWindow::new(start, end))
    }
}

/// Parses an RFC 3339 instant. A space where the offset sign should be is
/// read as `+`, since an unescaped `+` in a query string decodes to a space.
fn parse_instant(field: &'static str, value: &str) -> ProtocolResult<DateTime<Utc>> {
    let repaired = value.trim().replace(' ', "+");
    DateTime::parse_from_rfc3339(&repaired)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ProtocolError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Query string of `GET /bookings/my`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyBookingsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl MyBookingsQuery {
    /// Resolves the window the same way availability queries do.
    pub fn window(&self, now: DateTime<Utc>) -> ProtocolResult<TimeWindow> {
        AvailabilityQuery {
            start: self.start.clone(),
            end: self.end.clone(),
            ..AvailabilityQuery::default()
        }
        .window(now)
    }
}

/// Body of `GET /bookings/availability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// One outcome per requested room, keyed by room id.
    pub rooms: BTreeMap<String, RoomOutcome>,
}

impl AvailabilityResponse {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            start: window.start,
            end: window.end,
            rooms: BTreeMap::new(),
        }
    }

    /// Builder: add one room's outcome.
    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>, outcome: RoomOutcome) -> Self {
        self.rooms.insert(room_id.into(), outcome);
        self
    }

    /// Number of rooms whose outcome is an error.
    pub fn failed_count(&self) -> usize {
        self.rooms.values().filter(|o| !o.is_ok()).count()
    }
}

/// Result for one room in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoomOutcome {
    Ok {
        /// Served from an expired cache entry after a failed refresh.
        stale: bool,
        window: WindowView,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl RoomOutcome {
    pub fn ok(window: WindowView, stale: bool) -> Self {
        Self::Ok { stale, window }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error { code, .. } => Some(*code),
            Self::Ok { .. } => None,
        }
    }
}

/// Availability of one room as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowView {
    pub room_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub policy_restricted: bool,
    pub bookings: Vec<BookingView>,
}

impl From<&AvailabilityWindow> for WindowView {
    fn from(window: &AvailabilityWindow) -> Self {
        Self {
            room_id: window.room_id.clone(),
            start: window.query_start,
            end: window.query_end,
            fetched_at: window.fetched_at,
            policy_restricted: window.policy_restricted,
            bookings: window.bookings.iter().map(BookingView::from).collect(),
        }
    }
}

/// A booking as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingView {
    pub id: String,
    pub room_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<&Booking> for BookingView {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id(),
            room_id: booking.room_id.clone(),
            title: booking.subject.clone(),
            start: booking.start,
            end: booking.end,
        }
    }
}

/// Where a caller's booking was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingSource {
    /// The service account's Exchange calendar.
    Exchange,
    /// The My University booking system.
    MyUni,
}

/// A booking that belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBookingView {
    /// Exchange item id or My University booking number.
    pub id: String,
    pub source: BookingSource,
    pub room_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Attendee emails other than the room.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<String>,
}

impl From<UserBookingView> for BookingView {
    fn from(booking: UserBookingView) -> Self {
        Self {
            id: booking.id,
            room_id: booking.room_id,
            title: booking.title,
            start: booking.start,
            end: booking.end,
        }
    }
}

/// A booking source that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub source: BookingSource,
    pub code: ErrorCode,
    pub message: String,
}

/// Body of `GET /bookings/my`.
///
/// Bookings from every source that answered, ordered by start; sources
/// that failed are listed in `errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyBookingsResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bookings: Vec<UserBookingView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SourceError>,
}

impl MyBookingsResponse {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            start: window.start,
            end: window.end,
            bookings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Builder: add bookings from one source.
    #[must_use]
    pub fn with_bookings(mut self, bookings: impl IntoIterator<Item = UserBookingView>) -> Self {
        self.bookings.extend(bookings);
        self.bookings
            .sort_by(|a, b| (a.start, a.end, &a.id).cmp(&(b.start, b.end, &b.id)));
        self
    }

    /// Builder: record a failed source.
    #[must_use]
    pub fn with_error(
        mut self,
        source: BookingSource,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        self.errors.push(SourceError {
            source,
            code,
            message: message.into(),
        });
        self
    }
}

/// A room as listed by `GET /rooms`.
///
/// The upstream resource (mailbox or feed URL) is not exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomView {
    pub id: String,
    pub title: String,
    pub short_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<AccessLevel>,
    pub restrict_daytime: bool,
}

impl From<&Room> for RoomView {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id.clone(),
            title: room.title.clone(),
            short_name: room.short_name.clone(),
            capacity: room.capacity,
            access_level: room.access_level,
            restrict_daytime: room.restrict_daytime,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub version: String,
    pub uptime_seconds: u64,
    pub rooms: usize,
    pub cache: CacheStats,
}

impl StatusInfo {
    pub fn new(uptime_seconds: u64, rooms: usize, cache: CacheStats) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            rooms,
            cache,
        }
    }
}

/// Counters reported by the availability cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live cache slots.
    pub entries: usize,
    /// Lookups answered from a live entry.
    pub hits: u64,
    /// Lookups that needed an upstream call.
    pub misses: u64,
    /// Expired entries served after a failed refresh.
    pub stale_served: u64,
    /// Upstream calls issued.
    pub fetches: u64,
    /// Upstream calls that failed.
    pub fetch_errors: u64,
}

/// Error codes reported per room or per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The requested room id is not in the registry.
    RoomNotFound,

    /// No booking with the requested id.
    BookingNotFound,

    /// Upstream connection failure or timeout.
    UpstreamUnavailable,

    /// Upstream rejected the configured credentials.
    UpstreamAuthError,

    /// Upstream answered with something that is not calendar data.
    UpstreamMalformed,

    /// Invalid request parameters.
    InvalidRequest,

    /// Missing or rejected bearer token.
    Unauthorized,

    /// The caller is known but may not use this endpoint.
    Forbidden,

    /// The accounts service could not be reached.
    IdentityUnavailable,

    /// The My University booking system failed or refused the call.
    MyUniError,

    /// Unknown or internal error.
    InternalError,
}

impl ErrorCode {
    /// Returns a human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "Room not found",
            Self::BookingNotFound => "Booking not found",
            Self::UpstreamUnavailable => "Calendar server is unavailable",
            Self::UpstreamAuthError => "Calendar server rejected the credentials",
            Self::UpstreamMalformed => "Calendar server returned unreadable data",
            Self::InvalidRequest => "The request was invalid",
            Self::Unauthorized => "Authentication required",
            Self::Forbidden => "Not allowed for this caller",
            Self::IdentityUnavailable => "Accounts service is unavailable",
            Self::MyUniError => "My University booking system failed",
            Self::InternalError => "An internal error occurred",
        }
    }
}

/// Request-level error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

impl std::error::Error for ErrorResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    mod query {
        use super::*;

        #[test]
        fn missing_or_all_room_ids_select_every_room() {
            let query = AvailabilityQuery::default();
            assert_eq!(
                query.selection().unwrap(),
                RoomSelection::All { include_red: false }
            );

            let query = AvailabilityQuery {
                room_ids: Some("ALL".into()),
                include_red: true,
                ..Default::default()
            };
            assert_eq!(
                query.selection().unwrap(),
                RoomSelection::All { include_red: true }
            );
        }

        #[test]
        fn room_ids_are_trimmed_and_deduplicated() {
            let query = AvailabilityQuery::for_rooms(["301", " 302 ", "301", ""]);
            assert_eq!(
                query.selection().unwrap(),
                RoomSelection::Ids(vec!["301".into(), "302".into()])
            );
        }

        #[test]
        fn empty_room_list_is_rejected() {
            let query = AvailabilityQuery {
                room_ids: Some(" , ,".into()),
                ..Default::default()
            };
            assert_eq!(query.selection(), Err(ProtocolError::EmptyRoomList));
        }

        #[test]
        fn default_window_starts_at_current_minute() {
            let now = utc(2025, 3, 3, 10, 15) + Duration::seconds(42);
            let window = AvailabilityQuery::default().window(now).unwrap();
            assert_eq!(window.start, utc(2025, 3, 3, 10, 15));
            assert_eq!(window.end, utc(2025, 3, 10, 10, 15));
        }

        #[test]
        fn explicit_window_accepts_offsets_and_decoded_plus() {
            let query = AvailabilityQuery {
                start: Some("2025-03-03T08:00:00 03:00".into()),
                end: Some("2025-03-03T12:00:00Z".into()),
                ..Default::default()
            };
            let window = query.window(utc(2025, 1, 1, 0, 0)).unwrap();
            assert_eq!(window.start, utc(2025, 3, 3, 5, 0));
            assert_eq!(window.end, utc(2025, 3, 3, 12, 0));
        }

        #[test]
        fn inverted_and_oversized_windows_are_rejected() {
            let now = utc(2025, 3, 3, 0, 0);
            let inverted =
                AvailabilityQuery::default().between(utc(2025, 3, 3, 12, 0), utc(2025, 3, 3, 8, 0));
            assert!(matches!(
                inverted.window(now),
                Err(ProtocolError::InvertedWindow { .. })
            ));

            let long =
                AvailabilityQuery::default().between(utc(2025, 3, 1, 0, 0), utc(2025, 4, 15, 0, 0));
            assert_eq!(
                long.window(now),
                Err(ProtocolError::WindowTooLong { days: 45, max: 31 })
            );
        }

        #[test]
        fn garbage_timestamp_is_rejected() {
            let query = AvailabilityQuery {
                start: Some("tomorrow".into()),
                ..Default::default()
            };
            let err = query.window(utc(2025, 3, 3, 0, 0)).unwrap_err();
            assert!(err.to_string().contains("start"));
            let response = ErrorResponse::from(err);
            assert_eq!(response.code, ErrorCode::InvalidRequest);
        }
    }

    mod outcome {
        use super::*;

        fn window() -> AvailabilityWindow {
            AvailabilityWindow {
                room_id: "301".into(),
                query_start: utc(2025, 3, 3, 8, 0),
                query_end: utc(2025, 3, 3, 12, 0),
                bookings: vec![Booking::new(
                    "301",
                    utc(2025, 3, 3, 9, 0),
                    utc(2025, 3, 3, 11, 0),
                    "Seminar",
                )],
                fetched_at: utc(2025, 3, 3, 7, 59),
                policy_restricted: true,
            }
        }

        #[test]
        fn ok_outcome_shape() {
            let outcome = RoomOutcome::ok(WindowView::from(&window()), false);
            insta::assert_json_snapshot!(outcome, @r#"
            {
              "status": "ok",
              "stale": false,
              "window": {
                "room_id": "301",
                "start": "2025-03-03T08:00:00Z",
                "end": "2025-03-03T12:00:00Z",
                "fetched_at": "2025-03-03T07:59:00Z",
                "policy_restricted": true,
                "bookings": [
                  {
                    "id": "301-1740992400-1740999600",
                    "room_id": "301",
                    "title": "Seminar",
                    "start": "2025-03-03T09:00:00Z",
                    "end": "2025-03-03T11:00:00Z"
                  }
                ]
              }
            }
            "#);
        }

        #[test]
        fn error_outcome_serde() {
            let outcome = RoomOutcome::error(ErrorCode::UpstreamUnavailable, "timed out");
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(
                json,
                r#"{"status":"error","code":"upstream_unavailable","message":"timed out"}"#
            );

            let parsed: RoomOutcome = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.error_code(), Some(ErrorCode::UpstreamUnavailable));
            assert!(!parsed.is_ok());
        }

        #[test]
        fn response_keys_rooms_in_order() {
            let response = AvailabilityResponse::new(window().window())
                .with_room("b", RoomOutcome::ok(WindowView::from(&window()), true))
                .with_room("a", RoomOutcome::error(ErrorCode::RoomNotFound, "no such room"));
            let keys: Vec<_> = response.rooms.keys().cloned().collect();
            assert_eq!(keys, vec!["a", "b"]);
            assert_eq!(response.failed_count(), 1);
        }
    }

    #[test]
    fn my_bookings_are_ordered_and_errors_listed() {
        let booking = |id: &str, source, hour| UserBookingView {
            id: id.to_string(),
            source,
            room_id: "301".into(),
            title: "Busy".into(),
            start: utc(2025, 3, 3, hour, 0),
            end: utc(2025, 3, 3, hour + 1, 0),
            attendees: Vec::new(),
        };
        let window = TimeWindow::new(utc(2025, 3, 3, 0, 0), utc(2025, 3, 4, 0, 0));
        let response = MyBookingsResponse::new(window)
            .with_bookings([booking("A1", BookingSource::Exchange, 14)])
            .with_bookings([booking("17", BookingSource::MyUni, 9)])
            .with_error(BookingSource::MyUni, ErrorCode::MyUniError, "token rejected");

        let ids: Vec<_> = response.bookings.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["17", "A1"]);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["bookings"][0]["source"], "my_uni");
        assert!(json["bookings"][0].get("attendees").is_none());
        assert_eq!(json["errors"][0]["code"], "my_uni_error");
    }

    #[test]
    fn my_bookings_window_defaults_like_availability() {
        let now = utc(2025, 3, 3, 10, 15);
        let window = MyBookingsQuery::default().window(now).unwrap();
        assert_eq!(window.end, utc(2025, 3, 10, 10, 15));

        let query = MyBookingsQuery {
            start: Some("2025-03-05T00:00:00Z".into()),
            end: Some("2025-03-04T00:00:00Z".into()),
        };
        assert!(matches!(
            query.window(now),
            Err(ProtocolError::InvertedWindow { .. })
        ));
    }

    #[test]
    fn room_view_hides_resource() {
        let registry = roombook_core::RoomRegistry::load([roombook_core::RoomSpec::mailbox(
            "301",
            "Lecture 301",
            "301",
            "r301@uni.example",
        )
        .with_capacity(40)])
        .unwrap();
        let view = RoomView::from(registry.get("301").unwrap().as_ref());
        let json = serde_json::to_string(&view).unwrap();
        assert_eq!(
            json,
            r#"{"id":"301","title":"Lecture 301","short_name":"301","capacity":40,"restrict_daytime":false}"#
        );
    }

    #[test]
    fn status_info_reports_version() {
        let info = StatusInfo::new(3600, 12, CacheStats::default());
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains(r#""uptime_seconds":3600"#));
        assert!(json.contains(r#""rooms":12"#));
        assert!(json.contains(r#""stale_served":0"#));
    }

    #[test]
    fn error_code_serde_and_description() {
        let json = serde_json::to_string(&ErrorCode::UpstreamAuthError).unwrap();
        assert_eq!(json, r#""upstream_auth_error""#);
        assert!(!ErrorCode::IdentityUnavailable.description().is_empty());

        let error = ErrorResponse::unauthorized("missing bearer token");
        assert!(error.to_string().contains("missing bearer token"));
    }
}
