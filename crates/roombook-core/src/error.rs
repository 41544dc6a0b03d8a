//! Errors raised while building core values from untrusted input.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Validation failures for windows, rooms and policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A window whose start is after its end.
    #[error("invalid time window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// A room entry lacks one of the required fields.
    #[error("room #{index}: missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    /// Two room entries share an id.
    #[error("duplicate room id `{0}`")]
    DuplicateRoom(String),

    /// The room's resource identifier is unusable.
    #[error("room `{id}`: {reason}")]
    InvalidResource { id: String, reason: String },

    /// An access list names a room that is not configured.
    #[error("access list for unknown room `{0}`")]
    UnknownAccessListRoom(String),

    /// The timezone name is not in the IANA database.
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
}

impl CoreError {
    pub fn invalid_resource(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
