//! Exchange-backed [`CalendarFetcher`](crate::CalendarFetcher).
//!
//! Mailbox rooms are queried through EWS `GetUserAvailability`; rooms with
//! a published calendar are read from their ICS feed. Both paths share one
//! HTTP client and its Basic/Digest negotiation. The service account's own
//! calendar is read with `FindItem` and `GetItem`.

mod auth;
mod client;
mod config;
mod ews;
mod fetcher;
mod ics;
mod items;

pub use client::ExchangeClient;
pub use config::ExchangeConfig;
pub use ews::{availability_request, parse_availability_response};
pub use fetcher::ExchangeFetcher;
pub use ics::parse_calendar;
pub use items::{
    ItemMessage, find_items_request, get_items_request, parse_find_items_response,
    parse_get_items_response,
};
