//! Errors raised while interpreting request parameters.

use thiserror::Error;

use crate::types::ErrorResponse;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A request that cannot be served as given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("room_ids is empty")]
    EmptyRoomList,

    #[error("invalid {field} timestamp '{value}': expected RFC 3339")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("window start {start} is after end {end}")]
    InvertedWindow { start: String, end: String },

    #[error("window spans {days} days, at most {max} allowed")]
    WindowTooLong { days: i64, max: i64 },
}

impl From<ProtocolError> for ErrorResponse {
    fn from(err: ProtocolError) -> Self {
        ErrorResponse::invalid_request(err.to_string())
    }
}
