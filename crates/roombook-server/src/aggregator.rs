//! Batch availability across rooms.
//!
//! Every requested room is looked up, fetched and normalized on its own
//! future; the batch completes once all of them have. A room that fails
//! contributes a [`FetchFailure`] to the result map and nothing else.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use roombook_core::{Booking, DaytimePolicy, Room, RoomRegistry, TimeWindow};
use roombook_protocol::{
    AvailabilityResponse, ErrorCode, RoomOutcome, RoomSelection, WindowView,
};
use roombook_providers::{
    AccountItem, CalendarFetcher, UpstreamError, UpstreamErrorCode, UpstreamResult,
    fetch_with_timeout, normalize,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::cache::{AvailabilityCache, CachedWindow};

/// Why one room in a batch has no availability.
#[derive(Debug, Clone, Error)]
pub enum FetchFailure {
    #[error("no room with id '{0}'")]
    RoomNotFound(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl FetchFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RoomNotFound(_) => ErrorCode::RoomNotFound,
            Self::Upstream(e) => upstream_code(e),
        }
    }
}

/// Wire code of an upstream failure.
pub fn upstream_code(error: &UpstreamError) -> ErrorCode {
    match error.code() {
        UpstreamErrorCode::Unavailable => ErrorCode::UpstreamUnavailable,
        UpstreamErrorCode::Auth => ErrorCode::UpstreamAuthError,
        UpstreamErrorCode::Malformed => ErrorCode::UpstreamMalformed,
    }
}

/// Outcome for one room.
pub type RoomResult = Result<CachedWindow, FetchFailure>;

/// Wire form of a batch result.
pub fn to_response(
    window: TimeWindow,
    results: BTreeMap<String, RoomResult>,
) -> AvailabilityResponse {
    results
        .into_iter()
        .fold(AvailabilityResponse::new(window), |response, (id, result)| {
            let outcome = match result {
                Ok(cached) => RoomOutcome::ok(WindowView::from(&cached.window), cached.stale),
                Err(failure) => RoomOutcome::error(failure.code(), failure.to_string()),
            };
            response.with_room(id, outcome)
        })
}

/// Fetches, normalizes and caches availability for batches of rooms.
pub struct AvailabilityService {
    registry: Arc<RoomRegistry>,
    fetcher: Arc<dyn CalendarFetcher>,
    cache: Arc<AvailabilityCache>,
    policy: DaytimePolicy,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl AvailabilityService {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

    pub fn new(
        registry: Arc<RoomRegistry>,
        fetcher: Arc<dyn CalendarFetcher>,
        cache: Arc<AvailabilityCache>,
        policy: DaytimePolicy,
    ) -> Self {
        Self {
            registry,
            fetcher,
            cache,
            policy,
            timeout: Self::DEFAULT_TIMEOUT,
            permits: Arc::new(Semaphore::new(Self::DEFAULT_MAX_CONCURRENCY)),
        }
    }

    /// Deadline for a single upstream call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound on simultaneous upstream calls across all requests.
    #[must_use]
    pub fn with_max_concurrency(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &AvailabilityCache {
        &self.cache
    }

    /// Room ids a selection stands for, as seen by the caller with `email`.
    pub fn resolve_selection(&self, selection: &RoomSelection, email: Option<&str>) -> Vec<String> {
        match selection {
            RoomSelection::All { include_red } => self
                .registry
                .visible(*include_red, email)
                .iter()
                .map(|room| room.id.clone())
                .collect(),
            RoomSelection::Ids(ids) => ids.clone(),
        }
    }

    /// Availability of every room in `room_ids` over `window`.
    pub async fn get_availability(
        &self,
        room_ids: &[String],
        window: &TimeWindow,
    ) -> BTreeMap<String, RoomResult> {
        self.get_availability_at(room_ids, window, Utc::now()).await
    }

    /// Like [`get_availability`](Self::get_availability), evaluating the
    /// daytime policy at `now`.
    #[instrument(skip(self, room_ids, window), fields(rooms = room_ids.len(), start = %window.start, end = %window.end))]
    pub async fn get_availability_at(
        &self,
        room_ids: &[String],
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, RoomResult> {
        let mut ids: Vec<&str> = room_ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();

        let lookups = ids.into_iter().map(|id| async move {
            let result = match self.registry.get(id) {
                Some(room) => self.room_availability(room, window, now).await,
                None => {
                    debug!(room_id = id, "unknown room requested");
                    Err(FetchFailure::RoomNotFound(id.to_string()))
                }
            };
            (id.to_string(), result)
        });
        let results: BTreeMap<String, RoomResult> = join_all(lookups).await.into_iter().collect();

        let failed = results.values().filter(|r| r.is_err()).count();
        if failed > 0 {
            info!(rooms = results.len(), failed, "availability batch finished with failures");
        } else {
            debug!(rooms = results.len(), "availability batch finished");
        }
        results
    }

    /// Looks a booking up by the id [`Booking::id`] gave it.
    ///
    /// The room is read over the booking's bounds padded by a minute, so a
    /// longer booking that covers them gets a different id and no match.
    pub async fn find_booking(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, FetchFailure> {
        let Some((room_id, start, end)) = Booking::parse_id(id) else {
            return Ok(None);
        };
        let Some(room) = self.registry.get(room_id) else {
            return Err(FetchFailure::RoomNotFound(room_id.to_string()));
        };
        let pad = chrono::Duration::minutes(1);
        let window = TimeWindow::new(start - pad, end + pad);
        let cached = self.room_availability(room, &window, now).await?;
        Ok(cached.window.bookings.into_iter().find(|b| b.id() == id))
    }

    /// Service-account calendar items overlapping `window`.
    pub async fn account_items(&self, window: &TimeWindow) -> UpstreamResult<Vec<AccountItem>> {
        self.bounded("account_items", self.fetcher.account_items(window))
            .await
    }

    /// One service-account calendar item.
    pub async fn account_item(&self, item_id: &str) -> UpstreamResult<Option<AccountItem>> {
        self.bounded("account_item", self.fetcher.account_item(item_id))
            .await
    }

    /// Runs an upstream call under the shared permits and deadline.
    async fn bounded<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = UpstreamResult<T>>,
    ) -> UpstreamResult<T> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::unavailable("upstream fetch pool closed"))?;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    call,
                    fetcher = self.fetcher.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "upstream call timed out"
                );
                Err(UpstreamError::unavailable(format!(
                    "no answer within {}s",
                    self.timeout.as_secs_f64()
                )))
            }
        }
    }

    async fn room_availability(
        &self,
        room: &Arc<Room>,
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> RoomResult {
        let fetched = self
            .cache
            .get_or_fetch(&room.id, window, |snapped| async move {
                let _permit = self.permits.acquire().await.map_err(|_| {
                    UpstreamError::unavailable("upstream fetch pool closed").with_room(&room.id)
                })?;
                let raw =
                    fetch_with_timeout(self.fetcher.as_ref(), room, &snapped, self.timeout).await?;
                Ok::<_, UpstreamError>(normalize(&raw, room, &snapped, now, &self.policy))
            })
            .await;

        match fetched {
            Ok(mut cached) => {
                cached.window.policy_restricted = self.policy.restricts(room, now);
                Ok(cached)
            }
            Err(error) => {
                warn!(
                    room_id = %room.id,
                    code = error.code().as_str(),
                    error = %error,
                    "room availability failed"
                );
                Err(FetchFailure::Upstream(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use roombook_core::RoomSpec;
    use roombook_providers::{BoxFuture, RawEvent, UpstreamResult};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    /// Serves canned events per room and fails the rooms it is told to.
    #[derive(Default)]
    struct ScriptedFetcher {
        events: HashMap<String, Vec<RawEvent>>,
        failing: HashMap<String, UpstreamErrorCode>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn with_events(mut self, room: &str, events: Vec<RawEvent>) -> Self {
            self.events.insert(room.to_string(), events);
            self
        }

        fn failing(mut self, room: &str, code: UpstreamErrorCode) -> Self {
            self.failing.insert(room.to_string(), code);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CalendarFetcher for ScriptedFetcher {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch<'a>(
            &'a self,
            room: &'a Room,
            _window: &'a TimeWindow,
        ) -> BoxFuture<'a, UpstreamResult<Vec<RawEvent>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if let Some(code) = self.failing.get(&room.id) {
                    return Err(UpstreamError::new(*code, "scripted failure"));
                }
                Ok(self.events.get(&room.id).cloned().unwrap_or_default())
            })
        }
    }

    fn registry(ids: &[&str]) -> Arc<RoomRegistry> {
        let specs = ids.iter().map(|id| {
            RoomSpec::mailbox(*id, format!("Room {id}"), *id, format!("{id}@uni.example"))
        });
        Arc::new(RoomRegistry::load(specs).unwrap())
    }

    fn service(registry: Arc<RoomRegistry>, fetcher: Arc<ScriptedFetcher>) -> AvailabilityService {
        AvailabilityService::new(
            registry,
            fetcher,
            Arc::new(AvailabilityCache::new(Duration::from_secs(60))),
            DaytimePolicy::default(),
        )
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn morning_window() -> TimeWindow {
        TimeWindow::new(utc(3, 8, 0), utc(3, 12, 0))
    }

    #[tokio::test]
    async fn failing_room_does_not_affect_the_rest() {
        let rooms = ["r1", "r2", "r3", "r4", "r5"];
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .failing("r2", UpstreamErrorCode::Unavailable)
                .failing("r4", UpstreamErrorCode::Unavailable),
        );
        let service = service(registry(&rooms), fetcher.clone());

        let results = service
            .get_availability_at(&ids(&rooms), &morning_window(), utc(3, 5, 0))
            .await;

        assert_eq!(results.len(), 5);
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(failed, vec!["r2", "r4"]);
        for id in ["r2", "r4"] {
            let failure = results[id].as_ref().unwrap_err();
            assert_eq!(failure.code(), ErrorCode::UpstreamUnavailable);
        }
        assert_eq!(fetcher.calls(), 5);
    }

    #[tokio::test]
    async fn unknown_room_is_reported_alone() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let service = service(registry(&["301", "302"]), fetcher.clone());

        let results = service
            .get_availability_at(&ids(&["301", "999", "302"]), &morning_window(), utc(3, 5, 0))
            .await;

        assert!(results["301"].is_ok());
        assert!(results["302"].is_ok());
        let missing = results["999"].as_ref().unwrap_err();
        assert_eq!(missing.code(), ErrorCode::RoomNotFound);
        assert_eq!(missing.to_string(), "no room with id '999'");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn duplicate_ids_are_fetched_once() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let service = service(registry(&["301"]), fetcher.clone());

        let results = service
            .get_availability_at(&ids(&["301", "301"]), &morning_window(), utc(3, 5, 0))
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn restricted_room_and_merged_bookings() {
        let registry = Arc::new(
            RoomRegistry::load([
                RoomSpec::mailbox("A", "Room A", "A", "a@uni.example").with_restrict_daytime(true),
                RoomSpec::mailbox("B", "Room B", "B", "b@uni.example"),
            ])
            .unwrap(),
        );
        let fetcher = Arc::new(ScriptedFetcher::default().with_events(
            "B",
            vec![
                RawEvent::busy(utc(3, 9, 0), utc(3, 10, 0)),
                RawEvent::busy(utc(3, 9, 30), utc(3, 11, 0)),
            ],
        ));
        let service = service(registry, fetcher);
        // Monday 10:00 in Moscow
        let now = utc(3, 7, 0);

        let results = service
            .get_availability_at(&ids(&["A", "B"]), &morning_window(), now)
            .await;

        let a = &results["A"].as_ref().unwrap().window;
        assert!(a.policy_restricted);
        assert!(a.bookings.is_empty());

        let b = &results["B"].as_ref().unwrap().window;
        assert!(!b.policy_restricted);
        assert_eq!(b.bookings.len(), 1);
        assert_eq!((b.bookings[0].start, b.bookings[0].end), (utc(3, 9, 0), utc(3, 11, 0)));
    }

    #[tokio::test]
    async fn cached_window_gets_policy_of_serve_time() {
        let registry = Arc::new(
            RoomRegistry::load([RoomSpec::mailbox("A", "Room A", "A", "a@uni.example")
                .with_restrict_daytime(true)])
            .unwrap(),
        );
        let fetcher = Arc::new(ScriptedFetcher::default());
        let service = service(registry, fetcher.clone());

        let morning = service
            .get_availability_at(&ids(&["A"]), &morning_window(), utc(3, 7, 0))
            .await;
        // 21:00 Moscow, same cache entry
        let evening = service
            .get_availability_at(&ids(&["A"]), &morning_window(), utc(3, 18, 0))
            .await;

        assert_eq!(fetcher.calls(), 1);
        assert!(morning["A"].as_ref().unwrap().window.policy_restricted);
        assert!(!evening["A"].as_ref().unwrap().window.policy_restricted);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_calls_are_bounded() {
        let rooms = ["r1", "r2", "r3", "r4", "r5", "r6"];
        let fetcher = Arc::new(ScriptedFetcher::default().with_delay(Duration::from_secs(1)));
        let service = service(registry(&rooms), fetcher.clone()).with_max_concurrency(2);

        let results = service
            .get_availability_at(&ids(&rooms), &morning_window(), utc(3, 5, 0))
            .await;

        assert!(results.values().all(Result::is_ok));
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_room_times_out_as_unavailable() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_delay(Duration::from_secs(60)));
        let service =
            service(registry(&["301"]), fetcher).with_timeout(Duration::from_secs(5));

        let results = service
            .get_availability_at(&ids(&["301"]), &morning_window(), utc(3, 5, 0))
            .await;

        let failure = results["301"].as_ref().unwrap_err();
        assert_eq!(failure.code(), ErrorCode::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn auth_and_malformed_codes_are_distinct() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .failing("a", UpstreamErrorCode::Auth)
                .failing("m", UpstreamErrorCode::Malformed),
        );
        let service = service(registry(&["a", "m"]), fetcher);

        let results = service
            .get_availability_at(&ids(&["a", "m"]), &morning_window(), utc(3, 5, 0))
            .await;
        let response = to_response(morning_window(), results);

        assert_eq!(response.failed_count(), 2);
        assert_eq!(response.rooms["a"].error_code(), Some(ErrorCode::UpstreamAuthError));
        assert_eq!(response.rooms["m"].error_code(), Some(ErrorCode::UpstreamMalformed));
    }

    #[test]
    fn all_selection_respects_red_rooms() {
        let registry = Arc::new(
            RoomRegistry::load([
                RoomSpec::mailbox("301", "Room 301", "301", "301@uni.example"),
                RoomSpec::mailbox("lab", "Lab", "Lab", "lab@uni.example")
                    .with_access_level(roombook_core::AccessLevel::Red),
            ])
            .unwrap(),
        );
        let service = service(registry, Arc::new(ScriptedFetcher::default()));

        assert_eq!(
            service.resolve_selection(&RoomSelection::All { include_red: false }, None),
            vec!["301"]
        );
        assert_eq!(
            service.resolve_selection(&RoomSelection::All { include_red: true }, None),
            vec!["301", "lab"]
        );
        assert_eq!(
            service.resolve_selection(&RoomSelection::Ids(vec!["x".into()]), None),
            vec!["x"]
        );
    }

    #[test]
    fn all_selection_includes_red_rooms_on_the_callers_list() {
        let registry = RoomRegistry::load([
            RoomSpec::mailbox("301", "Room 301", "301", "301@uni.example"),
            RoomSpec::mailbox("lab", "Lab", "Lab", "lab@uni.example")
                .with_access_level(roombook_core::AccessLevel::Red),
        ])
        .unwrap()
        .with_access_lists([(
            "lab".to_string(),
            vec![roombook_core::AccessEntry::new("t.teacher@uni.example")],
        )])
        .unwrap();
        let service = service(Arc::new(registry), Arc::new(ScriptedFetcher::default()));
        let all = RoomSelection::All { include_red: false };

        assert_eq!(
            service.resolve_selection(&all, Some("t.teacher@uni.example")),
            vec!["301", "lab"]
        );
        assert_eq!(
            service.resolve_selection(&all, Some("s.student@uni.example")),
            vec!["301"]
        );
    }

    #[tokio::test]
    async fn booking_is_found_by_its_id() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_events(
            "301",
            vec![
                RawEvent::busy(utc(3, 9, 0), utc(3, 10, 0)).with_subject("Seminar"),
                RawEvent::busy(utc(3, 13, 0), utc(3, 18, 0)),
            ],
        ));
        let service = service(registry(&["301"]), fetcher);
        let now = utc(3, 5, 0);

        let seminar = Booking::new("301", utc(3, 9, 0), utc(3, 10, 0), "Seminar");
        let found = service.find_booking(&seminar.id(), now).await.unwrap();
        assert_eq!(found, Some(seminar));

        // Part of the afternoon booking, not a booking of its own.
        let part = Booking::new("301", utc(3, 14, 0), utc(3, 15, 0), "Busy");
        assert_eq!(service.find_booking(&part.id(), now).await.unwrap(), None);

        assert_eq!(service.find_booking("not-an-id", now).await.unwrap(), None);
        let elsewhere = Booking::new("999", utc(3, 9, 0), utc(3, 10, 0), "x");
        assert!(matches!(
            service.find_booking(&elsewhere.id(), now).await,
            Err(FetchFailure::RoomNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn account_calls_share_the_deadline() {
        struct Stuck;

        impl CalendarFetcher for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }

            fn fetch<'a>(
                &'a self,
                _room: &'a Room,
                _window: &'a TimeWindow,
            ) -> BoxFuture<'a, UpstreamResult<Vec<RawEvent>>> {
                Box::pin(async { Ok(Vec::new()) })
            }

            fn account_items<'a>(
                &'a self,
                _window: &'a TimeWindow,
            ) -> BoxFuture<'a, UpstreamResult<Vec<AccountItem>>> {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(Vec::new())
                })
            }
        }

        let service = AvailabilityService::new(
            registry(&["301"]),
            Arc::new(Stuck),
            Arc::new(AvailabilityCache::new(Duration::from_secs(60))),
            DaytimePolicy::default(),
        )
        .with_timeout(Duration::from_secs(5));

        let err = service.account_items(&morning_window()).await.unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Unavailable);
        assert_eq!(
            service.account_item("A1").await.unwrap_err().code(),
            UpstreamErrorCode::Unavailable
        );
    }
}
