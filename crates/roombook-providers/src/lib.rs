//! Upstream calendar access for room availability.
//!
//! - [`CalendarFetcher`] - the trait every upstream implements
//! - [`RawEvent`] - busy entries as the upstream reports them
//! - [`normalize`] - turns raw entries into a clipped, merged
//!   [`AvailabilityWindow`](roombook_core::AvailabilityWindow)
//! - [`UpstreamError`] - the per-room failure taxonomy
//! - [`AccountItem`] - meetings in the service account's calendar
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │  EWS (SOAP)  │   │   ICS feed   │
//! └──────┬───────┘   └──────┬───────┘
//!        └─────────┬────────┘
//!                  ▼
//!          ExchangeFetcher ── CalendarFetcher
//!                  │
//!                  ▼
//!             Vec<RawEvent>
//!                  │ normalize()
//!                  ▼
//!          AvailabilityWindow
//! ```

pub mod account;
#[cfg(feature = "exchange")]
pub mod exchange;
pub mod error;
pub mod normalize;
pub mod provider;
pub mod raw_event;

pub use account::{AccountItem, Attendee, ResponseType};
pub use error::{UpstreamError, UpstreamErrorCode, UpstreamResult};
pub use normalize::{DEFAULT_SUBJECT, merge_overlapping, normalize};
pub use provider::{BoxFuture, CalendarFetcher, ErrorFetcher, fetch_with_timeout};
pub use raw_event::{BusyStatus, RawEvent, RawEventTime};
