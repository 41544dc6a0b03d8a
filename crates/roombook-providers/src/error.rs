//! Errors raised at the upstream calendar boundary.
//!
//! Every failure talking to Exchange collapses into one of three codes so
//! callers can tell a flaky network from a rejected credential from garbage
//! on the wire. Errors are cheap to clone: a single in-flight fetch hands
//! the same error to every caller waiting on it.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The category of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamErrorCode {
    /// Connection failure, timeout, throttling or a 5xx answer.
    Unavailable,
    /// The upstream rejected our credentials.
    Auth,
    /// The response could not be read as calendar data.
    Malformed,
}

impl UpstreamErrorCode {
    /// Transient failures the caller may retry or paper over with stale data.
    ///
    /// Auth errors stay broken until configuration changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Malformed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "upstream_unavailable",
            Self::Auth => "upstream_auth_error",
            Self::Malformed => "upstream_malformed",
        }
    }
}

impl fmt::Display for UpstreamErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest payload excerpt kept on a malformed-response error.
pub const PAYLOAD_EXCERPT_LEN: usize = 256;

/// A failure while fetching a room's calendar.
#[derive(Debug, Clone, Error)]
pub struct UpstreamError {
    code: UpstreamErrorCode,
    message: String,
    room_id: Option<String>,
    payload_excerpt: Option<String>,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl UpstreamError {
    pub fn new(code: UpstreamErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            room_id: None,
            payload_excerpt: None,
            source: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorCode::Unavailable, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorCode::Auth, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorCode::Malformed, message)
    }

    /// Marks the error with the room it was raised for.
    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Keeps the head of the offending payload for logs.
    #[must_use]
    pub fn with_payload(mut self, payload: &str) -> Self {
        let mut excerpt: String = payload.chars().take(PAYLOAD_EXCERPT_LEN).collect();
        if excerpt.len() < payload.len() {
            excerpt.push('…');
        }
        self.payload_excerpt = Some(excerpt);
        self
    }

    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn code(&self) -> UpstreamErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn payload_excerpt(&self) -> Option<&str> {
        self.payload_excerpt.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref room_id) = self.room_id {
            write!(f, "[{room_id}] ")?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        let error = if err.is_timeout() {
            Self::unavailable("request timed out")
        } else if err.is_connect() {
            Self::unavailable("connection failed")
        } else if err.is_decode() || err.is_body() {
            Self::malformed(format!("failed to read response body: {err}"))
        } else if let Some(status) = err.status() {
            Self::unavailable(format!("HTTP {status}"))
        } else {
            Self::unavailable(format!("request failed: {err}"))
        };
        error.with_source(err)
    }
}

/// A specialized Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn codes_have_stable_names() {
        assert_eq!(UpstreamErrorCode::Unavailable.as_str(), "upstream_unavailable");
        assert_eq!(UpstreamErrorCode::Auth.as_str(), "upstream_auth_error");
        assert_eq!(UpstreamErrorCode::Malformed.as_str(), "upstream_malformed");
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        assert!(UpstreamError::unavailable("x").is_retryable());
        assert!(UpstreamError::malformed("x").is_retryable());
        assert!(!UpstreamError::auth("x").is_retryable());
    }

    #[test]
    fn display_includes_room_and_code() {
        let err = UpstreamError::auth("credential rejected").with_room("301");
        assert_eq!(err.to_string(), "[301] upstream_auth_error: credential rejected");
    }

    #[test]
    fn payload_excerpt_is_truncated() {
        let payload = "x".repeat(1000);
        let err = UpstreamError::malformed("bad").with_payload(&payload);
        let excerpt = err.payload_excerpt().unwrap();
        assert_eq!(excerpt.chars().count(), PAYLOAD_EXCERPT_LEN + 1);
        assert!(excerpt.ends_with('…'));

        let err = UpstreamError::malformed("bad").with_payload("short");
        assert_eq!(err.payload_excerpt(), Some("short"));
    }

    #[test]
    fn source_survives_clone() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = UpstreamError::unavailable("fetch failed").with_source(io);
        let cloned = err.clone();
        assert_eq!(cloned.source().unwrap().to_string(), "reset");
    }
}
