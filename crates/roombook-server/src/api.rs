//! HTTP API.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /health` | [`health`] |
//! | `GET /status` | [`status`] |
//! | `GET /rooms` | [`list_rooms`] |
//! | `GET /rooms/{id}` | [`get_room`] |
//! | `POST /rooms/{id}/refresh` | [`refresh_room`] |
//! | `GET /bookings/availability` | [`availability`] |
//! | `GET /bookings/my` | [`my_bookings`] |
//! | `GET /bookings/{id}` | [`get_booking`] |
//!
//! Everything except `/health` needs `Authorization: Bearer <token>`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::QueryRejection;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use roombook_protocol::{
    AvailabilityQuery, AvailabilityResponse, BookingSource, BookingView, ErrorCode,
    ErrorResponse, HealthResponse, MyBookingsQuery, MyBookingsResponse, ProtocolError, RoomView,
    StatusInfo,
};
use roombook_providers::{UpstreamError, UpstreamErrorCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::aggregator::{AvailabilityService, FetchFailure, to_response, upstream_code};
use crate::auth::{AuthError, Identity, IdentityVerifier, bearer_token};
use crate::bookings::{exchange_booking, exchange_bookings_of, my_uni_bookings};
use crate::my_uni::{MyUniClient, MyUniError};

/// Shared application state.
pub struct AppState {
    pub service: AvailabilityService,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Read-only My University client, when configured.
    pub my_uni: Option<MyUniClient>,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(service: AvailabilityService, verifier: Arc<dyn IdentityVerifier>) -> SharedState {
        Self::with_my_uni(service, verifier, None)
    }

    pub fn with_my_uni(
        service: AvailabilityService,
        verifier: Arc<dyn IdentityVerifier>,
        my_uni: Option<MyUniClient>,
    ) -> SharedState {
        Arc::new(Self {
            service,
            verifier,
            my_uni,
            started_at: Instant::now(),
        })
    }
}

/// Builds the router with all endpoints.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/rooms", get(list_rooms))
        .route("/rooms/{id}", get(get_room))
        .route("/rooms/{id}/refresh", post(refresh_room))
        .route("/bookings/availability", get(availability))
        .route("/bookings/my", get(my_bookings))
        .route("/bookings/{id}", get(get_booking))
        .with_state(state)
}

/// A request-level failure rendered as [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(code, message),
        }
    }

    fn room_not_found(id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::RoomNotFound,
            format!("no room with id '{id}'"),
        )
    }

    fn booking_not_found(id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::BookingNotFound,
            format!("no booking with id '{id}'"),
        )
    }

    fn upstream(err: &UpstreamError) -> Self {
        let status = match err.code() {
            UpstreamErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            UpstreamErrorCode::Auth | UpstreamErrorCode::Malformed => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, upstream_code(err), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing | AuthError::Rejected(_) => {
                Self::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, err.to_string())
            }
            AuthError::Unavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::IdentityUnavailable,
                err.to_string(),
            ),
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: err.into(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(err: QueryRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            err.body_text(),
        )
    }
}

/// The verified caller of a request.
#[derive(Debug, Clone)]
pub struct Caller(pub Identity);

impl FromRequestParts<SharedState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = bearer_token(header)?;
        match state.verifier.verify(token).await {
            Ok(identity) => Ok(Caller(identity)),
            Err(err) => {
                debug!(error = %err, path = %parts.uri.path(), "request not authorized");
                Err(err.into())
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomsQuery {
    #[serde(default)]
    pub include_red: bool,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

/// `GET /status`
pub async fn status(_caller: Caller, State(state): State<SharedState>) -> Json<StatusInfo> {
    Json(StatusInfo::new(
        state.started_at.elapsed().as_secs(),
        state.service.registry().len(),
        state.service.cache().stats(),
    ))
}

/// `GET /rooms`
///
/// Red rooms are listed with `include_red`, or when the caller is on their
/// access list.
pub async fn list_rooms(
    Caller(caller): Caller,
    State(state): State<SharedState>,
    query: Result<Query<RoomsQuery>, QueryRejection>,
) -> Result<Json<Vec<RoomView>>, ApiError> {
    let Query(query) = query?;
    let rooms = state
        .service
        .registry()
        .visible(query.include_red, caller.email.as_deref())
        .iter()
        .map(|room| RoomView::from(room.as_ref()))
        .collect();
    Ok(Json(rooms))
}

/// `GET /rooms/{id}`
pub async fn get_room(
    _caller: Caller,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<RoomView>, ApiError> {
    state
        .service
        .registry()
        .get(&id)
        .map(|room| Json(RoomView::from(room.as_ref())))
        .ok_or_else(|| ApiError::room_not_found(&id))
}

/// `POST /rooms/{id}/refresh`
#[instrument(skip_all, fields(room_id = %id, caller = %caller.0.subject))]
pub async fn refresh_room(
    caller: Caller,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.service.registry().get(&id).is_none() {
        return Err(ApiError::room_not_found(&id));
    }
    let removed = state.service.cache().invalidate(&id);
    debug!(removed, "room cache invalidated");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /bookings/availability`
#[instrument(skip_all, fields(caller = %caller.0.subject))]
pub async fn availability(
    caller: Caller,
    State(state): State<SharedState>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let Query(query) = query?;
    let selection = query.selection()?;
    let window = query.window(Utc::now())?;
    let room_ids = state
        .service
        .resolve_selection(&selection, caller.0.email.as_deref());

    let results = state.service.get_availability(&room_ids, &window).await;
    let response = to_response(window, results);
    if response.failed_count() > 0 {
        warn!(
            rooms = response.rooms.len(),
            failed = response.failed_count(),
            "availability answered with failed rooms"
        );
    }
    Ok(Json(response))
}

/// `GET /bookings/my`
///
/// Meetings in the service account's calendar that list the caller, plus
/// the caller's My University bookings. A source that fails is reported in
/// `errors` and the others are still answered.
#[instrument(skip_all, fields(caller = %caller.0.subject))]
pub async fn my_bookings(
    caller: Caller,
    State(state): State<SharedState>,
    query: Result<Query<MyBookingsQuery>, QueryRejection>,
) -> Result<Json<MyBookingsResponse>, ApiError> {
    let Query(query) = query?;
    let window = query.window(Utc::now())?;
    let Some(email) = caller.0.email.as_deref() else {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            "only people have bookings; this token carries no email",
        ));
    };

    let registry = state.service.registry();
    let exchange = state.service.account_items(&window);
    let my_uni = async {
        match state.my_uni.as_ref() {
            Some(client) => Some(client.list_bookings(email).await),
            None => None,
        }
    };
    let (exchange, my_uni) = tokio::join!(exchange, my_uni);

    let mut response = MyBookingsResponse::new(window);
    match exchange {
        Ok(items) => {
            response = response.with_bookings(exchange_bookings_of(registry, &items, email));
        }
        Err(err) => {
            warn!(error = %err, "service account calendar unavailable");
            response =
                response.with_error(BookingSource::Exchange, upstream_code(&err), err.to_string());
        }
    }
    match my_uni {
        Some(Ok(bookings)) => {
            response = response.with_bookings(my_uni_bookings(registry, bookings, &window));
        }
        Some(Err(err)) => {
            warn!(error = %err, "my university bookings unavailable");
            response =
                response.with_error(BookingSource::MyUni, my_uni_code(&err), err.to_string());
        }
        None => {}
    }
    debug!(bookings = response.bookings.len(), "caller bookings listed");
    Ok(Json(response))
}

fn my_uni_code(err: &MyUniError) -> ErrorCode {
    match err {
        MyUniError::Unavailable(_) => ErrorCode::UpstreamUnavailable,
        MyUniError::Rejected(_) => ErrorCode::MyUniError,
        MyUniError::Malformed(_) => ErrorCode::UpstreamMalformed,
    }
}

/// `GET /bookings/{id}`
///
/// Takes either an id from an availability response or the Exchange item
/// id of a service-account meeting.
#[instrument(skip_all, fields(booking_id = %id, caller = %caller.0.subject))]
pub async fn get_booking(
    caller: Caller,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BookingView>, ApiError> {
    if roombook_core::Booking::parse_id(&id).is_some() {
        return match state.service.find_booking(&id, Utc::now()).await {
            Ok(Some(booking)) => Ok(Json(BookingView::from(&booking))),
            Ok(None) | Err(FetchFailure::RoomNotFound(_)) => Err(ApiError::booking_not_found(&id)),
            Err(FetchFailure::Upstream(err)) => Err(ApiError::upstream(&err)),
        };
    }

    match state.service.account_item(&id).await {
        Ok(Some(item)) => exchange_booking(state.service.registry(), &item)
            .map(|booking| Json(BookingView::from(booking)))
            .ok_or_else(|| ApiError::booking_not_found(&id)),
        Ok(None) => Err(ApiError::booking_not_found(&id)),
        Err(err) => {
            warn!(error = %err, "booking lookup failed");
            Err(ApiError::upstream(&err))
        }
    }
}
