//! Wire types of the room availability HTTP API.
//!
//! Every body is JSON. A multi-room availability request always answers
//! `200` with one [`RoomOutcome`] per requested id; only request-level
//! problems (bad window, bad token) produce an [`ErrorResponse`] body.
//!
//! ```rust
//! use roombook_protocol::{ErrorCode, RoomOutcome};
//!
//! let outcome = RoomOutcome::error(ErrorCode::RoomNotFound, "no room with id '999'");
//! let json = serde_json::to_string(&outcome).unwrap();
//! assert!(json.contains(r#""status":"error""#));
//! ```

mod error;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use types::{
    AvailabilityQuery, AvailabilityResponse, BookingSource, BookingView, CacheStats, ErrorCode,
    ErrorResponse, HealthResponse, MyBookingsQuery, MyBookingsResponse, RoomOutcome,
    RoomSelection, RoomView, SourceError, StatusInfo, UserBookingView, WindowView,
};

/// Upper bound on a query window.
pub const MAX_WINDOW_DAYS: i64 = 31;

/// Query window used when the caller gives no `end`.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;
