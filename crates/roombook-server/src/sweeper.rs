//! Background sweep of idle cache slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::cache::AvailabilityCache;
use crate::signals::ShutdownHandle;

/// Runs [`AvailabilityCache::sweep`] every `interval` until shutdown.
pub fn spawn_sweeper(
    cache: Arc<AvailabilityCache>,
    interval: Duration,
    shutdown: ShutdownHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.sweep(Instant::now());
                    trace!(removed, remaining = cache.len(), "cache sweep");
                }
                _ = shutdown.wait() => break,
            }
        }
        debug!("cache sweeper stopped");
    })
}
