//! Read-only client for the My University booking system.
//!
//! Some rooms are also bookable through My University. Its bookings never
//! reach Exchange, so `GET /bookings/my` asks it directly:
//!
//! ```text
//! GET {api_url}/room-booking/list?email=<caller>
//! X-Booking-Token: <token>
//! ```
//!
//! Times come back as local wall-clock strings in the configured zone.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::MyUniSettings;
use crate::error::ConfigError;

const TOKEN_HEADER: &str = "X-Booking-Token";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A booking as My University reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MyUniBooking {
    pub id: String,
    /// Room number on the My University side.
    pub room: u32,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MyUniError {
    #[error("my university unreachable: {0}")]
    Unavailable(String),

    /// The service answered with an error of its own.
    #[error("my university refused: {0}")]
    Rejected(String),

    #[error("unreadable my university response: {0}")]
    Malformed(String),
}

/// Numbers arrive either as JSON numbers or as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

impl Number {
    fn text(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBooking {
    id: Number,
    room_id: Number,
    #[serde(default)]
    title: String,
    start_time: String,
    end_time: String,
}

/// An empty result is a JSON list, a non-empty one an object keyed by id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBookings {
    Map(BTreeMap<String, RawBooking>),
    List(Vec<RawBooking>),
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    bookings: RawBookings,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct MyUniClient {
    http: reqwest::Client,
    list_url: Url,
    token: String,
    timezone: Tz,
}

impl MyUniClient {
    pub fn new(
        api_url: &Url,
        token: impl Into<String>,
        timezone: Tz,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let list_url = Url::parse(&format!(
            "{}/room-booking/list",
            api_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| ConfigError::invalid("my_uni.api_url", e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("roombook/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::invalid("my_uni.api_url", e.to_string()))?;
        Ok(Self {
            http,
            list_url,
            token: token.into(),
            timezone,
        })
    }

    /// Builds the client from `[my_uni]`, or `None` when it is not set up.
    pub fn from_settings(
        settings: &MyUniSettings,
        timezone: Tz,
        timeout: Duration,
    ) -> Result<Option<Self>, ConfigError> {
        let (Some(api_url), Some(token)) = (settings.api_url.as_deref(), settings.token()?) else {
            return Ok(None);
        };
        let api_url =
            Url::parse(api_url).map_err(|e| ConfigError::invalid("my_uni.api_url", e.to_string()))?;
        Self::new(&api_url, token, timezone, timeout).map(Some)
    }

    pub fn list_url(&self) -> &Url {
        &self.list_url
    }

    /// Bookings made by `email`.
    #[instrument(skip(self))]
    pub async fn list_bookings(&self, email: &str) -> Result<Vec<MyUniBooking>, MyUniError> {
        let response = self
            .http
            .get(self.list_url.clone())
            .query(&[("email", email)])
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "my university request failed");
                MyUniError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(match error_message(&body) {
                Some(error) if !status.is_server_error() => MyUniError::Rejected(error),
                Some(error) => MyUniError::Unavailable(error),
                None if status.is_server_error() => MyUniError::Unavailable(format!("HTTP {status}")),
                None => MyUniError::Rejected(format!("HTTP {status}")),
            });
        }

        let list: ListResponse = response
            .json()
            .await
            .map_err(|e| MyUniError::Malformed(e.to_string()))?;
        let raw = match list.bookings {
            RawBookings::Map(map) => map.into_values().collect(),
            RawBookings::List(list) => list,
        };
        let bookings: Vec<MyUniBooking> =
            raw.into_iter().filter_map(|b| self.convert(b)).collect();
        debug!(count = bookings.len(), "my university bookings listed");
        Ok(bookings)
    }

    fn convert(&self, raw: RawBooking) -> Option<MyUniBooking> {
        let id = raw.id.text();
        let Ok(room) = raw.room_id.text().parse::<u32>() else {
            warn!(%id, "my university booking with unusable room number, skipping");
            return None;
        };
        let times = self
            .local_time(&raw.start_time)
            .zip(self.local_time(&raw.end_time));
        let Some((start, end)) = times.filter(|(start, end)| start < end) else {
            warn!(%id, start = %raw.start_time, end = %raw.end_time, "my university booking with unusable times, skipping");
            return None;
        };
        Some(MyUniBooking {
            id,
            room,
            title: raw.title,
            start,
            end,
        })
    }

    fn local_time(&self, value: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT).ok()?;
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// The `error` field of a JSON error body.
fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.error)
        .filter(|e| !e.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn stub() -> Url {
        async fn list(
            headers: HeaderMap,
            Query(params): Query<HashMap<String, String>>,
        ) -> (AxumStatus, Json<serde_json::Value>) {
            if headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) != Some("secret") {
                return (
                    AxumStatus::FORBIDDEN,
                    Json(serde_json::json!({ "error": "Invalid token" })),
                );
            }
            match params.get("email").map(String::as_str) {
                Some("s.student@uni.example") => (
                    AxumStatus::OK,
                    Json(serde_json::json!({ "bookings": {
                        "17": { "id": 17, "room_id": 12, "title": "Club meeting",
                                "start_time": "2025-03-03 18:00:00", "end_time": "2025-03-03 20:00:00" },
                        "18": { "id": "18", "room_id": "abc", "title": "Broken",
                                "start_time": "2025-03-04 18:00:00", "end_time": "2025-03-04 20:00:00" },
                        "19": { "id": 19, "room_id": 12, "title": "Backwards",
                                "start_time": "2025-03-05 20:00:00", "end_time": "2025-03-05 18:00:00" }
                    }})),
                ),
                Some("nobody@uni.example") => {
                    (AxumStatus::OK, Json(serde_json::json!({ "bookings": [] })))
                }
                Some("crash@uni.example") => (
                    AxumStatus::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "database is down" })),
                ),
                _ => (
                    AxumStatus::NOT_FOUND,
                    Json(serde_json::json!({ "error": "User not found" })),
                ),
            }
        }

        let app = Router::new().route("/api/room-booking/list", get(list));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/api/")).unwrap()
    }

    fn client(url: &Url, token: &str) -> MyUniClient {
        MyUniClient::new(url, token, chrono_tz::Europe::Moscow, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_bookings_in_local_time() {
        let url = stub().await;
        let bookings = client(&url, "secret")
            .list_bookings("s.student@uni.example")
            .await
            .unwrap();

        assert_eq!(bookings.len(), 1);
        let booking = &bookings[0];
        assert_eq!(booking.id, "17");
        assert_eq!(booking.room, 12);
        assert_eq!(booking.title, "Club meeting");
        assert_eq!(
            booking.start,
            Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn empty_list_is_an_array() {
        let url = stub().await;
        let bookings = client(&url, "secret")
            .list_bookings("nobody@uni.example")
            .await
            .unwrap();
        assert!(bookings.is_empty());
    }

    #[tokio::test]
    async fn errors_keep_the_service_message() {
        let url = stub().await;
        assert_eq!(
            client(&url, "wrong").list_bookings("s.student@uni.example").await,
            Err(MyUniError::Rejected("Invalid token".into()))
        );
        assert_eq!(
            client(&url, "secret").list_bookings("ghost@uni.example").await,
            Err(MyUniError::Rejected("User not found".into()))
        );
        assert_eq!(
            client(&url, "secret").list_bookings("crash@uni.example").await,
            Err(MyUniError::Unavailable("database is down".into()))
        );
    }

    #[test]
    fn list_url_keeps_api_prefix() {
        let url = Url::parse("https://my.uni.example/api").unwrap();
        assert_eq!(
            client(&url, "t").list_url().as_str(),
            "https://my.uni.example/api/room-booking/list"
        );
    }

    #[test]
    fn settings_without_url_or_token_disable_the_client() {
        let settings = MyUniSettings::default();
        assert!(
            MyUniClient::from_settings(&settings, chrono_tz::UTC, Duration::from_secs(1))
                .unwrap()
                .is_none()
        );

        let settings = MyUniSettings {
            api_url: Some("https://my.uni.example/api".into()),
            token: Some("t".into()),
            ..MyUniSettings::default()
        };
        assert!(
            MyUniClient::from_settings(&settings, chrono_tz::UTC, Duration::from_secs(1))
                .unwrap()
                .is_some()
        );
    }
}
