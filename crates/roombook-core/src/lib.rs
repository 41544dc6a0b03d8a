//! Core types: rooms, bookings, time windows, daytime policy

pub mod booking;
pub mod error;
pub mod policy;
pub mod room;
pub mod time;
pub mod tracing;

pub use booking::{AvailabilityWindow, Booking};
pub use error::{CoreError, Result};
pub use policy::DaytimePolicy;
pub use room::{AccessEntry, AccessLevel, ResourceIdentifier, Room, RoomRegistry, RoomSpec};
pub use time::{TimeWindow, ceil_to_minute, floor_to_minute};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
