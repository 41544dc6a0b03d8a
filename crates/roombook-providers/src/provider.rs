//! The [`CalendarFetcher`] trait.
//!
//! A fetcher answers one question: given a room and a window, which busy
//! entries does the upstream report? Normalization, caching and policy live
//! elsewhere.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use roombook_core::{Room, TimeWindow};

use crate::account::AccountItem;
use crate::error::{UpstreamError, UpstreamResult};
use crate::raw_event::RawEvent;

/// A boxed future for async trait methods.
///
/// Boxing keeps the trait object-safe so fetchers can live behind
/// `Arc<dyn CalendarFetcher>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of raw busy entries for a room.
///
/// Implementations perform one upstream call per `fetch` and must not cache;
/// the server's TTL cache sits in front of them.
pub trait CalendarFetcher: Send + Sync {
    /// Short name used in logs, e.g. `"exchange"`.
    fn name(&self) -> &str;

    /// Fetches raw entries for `room` overlapping `window`.
    fn fetch<'a>(
        &'a self,
        room: &'a Room,
        window: &'a TimeWindow,
    ) -> BoxFuture<'a, UpstreamResult<Vec<RawEvent>>>;

    /// Items of the service account's calendar overlapping `window`.
    fn account_items<'a>(
        &'a self,
        _window: &'a TimeWindow,
    ) -> BoxFuture<'a, UpstreamResult<Vec<AccountItem>>> {
        let name = self.name().to_string();
        Box::pin(async move {
            Err(UpstreamError::unavailable(format!(
                "{name} has no account calendar"
            )))
        })
    }

    /// One item of the service account's calendar; `None` when it does not
    /// exist.
    fn account_item<'a>(
        &'a self,
        _item_id: &'a str,
    ) -> BoxFuture<'a, UpstreamResult<Option<AccountItem>>> {
        let name = self.name().to_string();
        Box::pin(async move {
            Err(UpstreamError::unavailable(format!(
                "{name} has no account calendar"
            )))
        })
    }
}

/// Runs `fetcher.fetch` under a deadline.
///
/// Exceeding `timeout` drops the in-flight request and yields
/// `upstream_unavailable`.
pub async fn fetch_with_timeout(
    fetcher: &dyn CalendarFetcher,
    room: &Room,
    window: &TimeWindow,
    timeout: Duration,
) -> UpstreamResult<Vec<RawEvent>> {
    match tokio::time::timeout(timeout, fetcher.fetch(room, window)).await {
        Ok(result) => result.map_err(|e| match e.room_id() {
            Some(_) => e,
            None => e.with_room(&room.id),
        }),
        Err(_) => {
            tracing::warn!(
                room_id = %room.id,
                fetcher = fetcher.name(),
                timeout_ms = timeout.as_millis() as u64,
                "upstream fetch timed out"
            );
            Err(UpstreamError::unavailable(format!(
                "no answer within {}s",
                timeout.as_secs_f64()
            ))
            .with_room(&room.id))
        }
    }
}

/// A fetcher that always fails with the same error.
///
/// Stands in for the Exchange fetcher when it cannot be configured, so
/// rooms still report a per-room failure instead of taking the server down.
#[derive(Debug)]
pub struct ErrorFetcher {
    name: String,
    error: UpstreamError,
}

impl ErrorFetcher {
    pub fn new(name: impl Into<String>, error: UpstreamError) -> Self {
        Self {
            name: name.into(),
            error,
        }
    }
}

impl CalendarFetcher for ErrorFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch<'a>(
        &'a self,
        room: &'a Room,
        _window: &'a TimeWindow,
    ) -> BoxFuture<'a, UpstreamResult<Vec<RawEvent>>> {
        let error = self.error.clone().with_room(&room.id);
        Box::pin(async move { Err(error) })
    }

    fn account_items<'a>(
        &'a self,
        _window: &'a TimeWindow,
    ) -> BoxFuture<'a, UpstreamResult<Vec<AccountItem>>> {
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }

    fn account_item<'a>(
        &'a self,
        _item_id: &'a str,
    ) -> BoxFuture<'a, UpstreamResult<Option<AccountItem>>> {
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamErrorCode;
    use chrono::{TimeZone, Utc};
    use roombook_core::{RoomRegistry, RoomSpec};

    struct SlowFetcher;

    impl CalendarFetcher for SlowFetcher {
        fn name(&self) -> &str {
            "slow"
        }

        fn fetch<'a>(
            &'a self,
            _room: &'a Room,
            _window: &'a TimeWindow,
        ) -> BoxFuture<'a, UpstreamResult<Vec<RawEvent>>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            })
        }
    }

    fn room() -> std::sync::Arc<Room> {
        RoomRegistry::load([RoomSpec::mailbox("301", "Lecture 301", "301", "r301@uni.example")])
            .unwrap()
            .get("301")
            .cloned()
            .unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn error_fetcher_tags_room() {
        let fetcher = ErrorFetcher::new("exchange", UpstreamError::auth("not configured"));
        let err = fetcher.fetch(&room(), &window()).await.unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Auth);
        assert_eq!(err.room_id(), Some("301"));
        assert_eq!(fetcher.name(), "exchange");
    }

    #[tokio::test]
    async fn account_calendar_is_optional() {
        let err = SlowFetcher.account_items(&window()).await.unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Unavailable);
        assert!(err.message().contains("slow"));

        let fetcher = ErrorFetcher::new("exchange", UpstreamError::auth("not configured"));
        let err = fetcher.account_item("AAMk1").await.unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_unavailable() {
        let err = fetch_with_timeout(&SlowFetcher, &room(), &window(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Unavailable);
        assert_eq!(err.room_id(), Some("301"));
    }
}
