//! Availability cache with TTL and single-flight refresh.
//!
//! Each `(room, window)` key owns a slot guarded by its own async mutex. The
//! caller that takes the lock on an expired slot performs the upstream fetch
//! while holding it; concurrent callers for the same key queue on the lock and
//! pick up the result when it is released. Different keys never wait on each
//! other: the outer map lock is only held to look a slot up.
//!
//! Slots with a fetch in progress are never removed from the map, so callers
//! arriving later still queue behind that fetch. [`AvailabilityCache::invalidate`]
//! marks such a slot instead, and the result of the running fetch is stored
//! already expired.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use roombook_core::{AvailabilityWindow, TimeWindow};
use roombook_protocol::CacheStats;
use roombook_providers::{UpstreamError, UpstreamResult};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Cache key: room id plus the minute-snapped query window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub room_id: String,
    pub window: TimeWindow,
}

impl CacheKey {
    pub fn new(room_id: impl Into<String>, window: &TimeWindow) -> Self {
        Self {
            room_id: room_id.into(),
            window: window.snapped(),
        }
    }
}

/// A window returned by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWindow {
    pub window: AvailabilityWindow,
    /// The entry expired and its refresh failed.
    pub stale: bool,
}

#[derive(Debug)]
struct Entry {
    window: AvailabilityWindow,
    expires_at: Instant,
}

#[derive(Debug)]
struct SlotState {
    entry: Option<Entry>,
    last_access: Instant,
    /// Error of the most recent fetch, kept so queued callers can share it.
    last_error: Option<UpstreamError>,
}

#[derive(Debug)]
struct Slot {
    state: Arc<tokio::sync::Mutex<SlotState>>,
    /// Bumped after every completed fetch.
    generation: AtomicU64,
    /// Invalidated while locked; consumed by the next holder of the lock.
    invalidated: AtomicBool,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            state: Arc::new(tokio::sync::Mutex::new(SlotState {
                entry: None,
                last_access: now,
                last_error: None,
            })),
            generation: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
}

/// Per-room availability cache.
#[derive(Debug)]
pub struct AvailabilityCache {
    ttl: Duration,
    idle_limit: Duration,
    slots: Mutex<HashMap<CacheKey, Arc<Slot>>>,
    counters: Counters,
}

impl AvailabilityCache {
    /// Idle slots are swept after this many TTLs by default.
    pub const DEFAULT_SWEEP_MULTIPLIER: u32 = 10;

    /// Creates an empty cache. `ttl` must be non-zero.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            idle_limit: ttl.saturating_mul(Self::DEFAULT_SWEEP_MULTIPLIER),
            slots: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Sets how many TTLs a slot may stay unused before [`sweep`](Self::sweep)
    /// drops it.
    #[must_use]
    pub fn with_sweep_multiplier(mut self, multiplier: u32) -> Self {
        self.idle_limit = self.ttl.saturating_mul(multiplier.max(1));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the live window for `room_id` over `window`, calling `fetch`
    /// when there is none.
    ///
    /// `fetch` receives the snapped window and runs at most once per key at a
    /// time. When it fails and an expired entry exists, that entry is returned
    /// with `stale` set instead of the error.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        room_id: &str,
        window: &TimeWindow,
        fetch: F,
    ) -> UpstreamResult<CachedWindow>
    where
        F: FnOnce(TimeWindow) -> Fut,
        Fut: Future<Output = UpstreamResult<AvailabilityWindow>>,
    {
        let key = CacheKey::new(room_id, window);
        let snapped = key.window;

        // The slot may be swept or invalidated between the lookup and the
        // lock; only the slot still in the map may fetch.
        let (slot, seen, mut state) = loop {
            let slot = self.slot(key.clone());
            let seen = slot.generation.load(Ordering::Acquire);
            let state = slot.state.clone().lock_owned().await;
            if self.holds(&key, &slot) {
                break (slot, seen, state);
            }
            trace!(room_id, "slot removed while waiting, retrying");
        };
        let now = Instant::now();
        state.last_access = now;
        if slot.invalidated.swap(false, Ordering::AcqRel) {
            state.entry = None;
            state.last_error = None;
        }

        if let Some(entry) = state.entry.as_ref().filter(|e| now < e.expires_at) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(room_id, "cache hit");
            return Ok(CachedWindow {
                window: entry.window.clone(),
                stale: false,
            });
        }

        // A fetch finished while we were queued and it failed: share it
        // rather than hitting the upstream again.
        if slot.generation.load(Ordering::Acquire) != seen {
            if let Some(ref error) = state.last_error {
                return match state.entry {
                    Some(ref entry) => {
                        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                        Ok(CachedWindow {
                            window: entry.window.clone(),
                            stale: true,
                        })
                    }
                    None => Err(error.clone()),
                };
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(room_id, start = %snapped.start, end = %snapped.end, "cache miss, fetching");

        let result = fetch(snapped).await;
        slot.generation.fetch_add(1, Ordering::Release);

        match result {
            Ok(fresh) => {
                let expires_at = if slot.invalidated.swap(false, Ordering::AcqRel) {
                    debug!(room_id, "invalidated during fetch, storing as expired");
                    Instant::now()
                } else {
                    Instant::now() + self.ttl
                };
                state.entry = Some(Entry {
                    window: fresh.clone(),
                    expires_at,
                });
                state.last_error = None;
                Ok(CachedWindow {
                    window: fresh,
                    stale: false,
                })
            }
            Err(error) => {
                self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                state.last_error = Some(error.clone());
                match state.entry {
                    Some(ref entry) => {
                        warn!(
                            room_id,
                            code = error.code().as_str(),
                            error = %error,
                            "refresh failed, serving stale entry"
                        );
                        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                        Ok(CachedWindow {
                            window: entry.window.clone(),
                            stale: true,
                        })
                    }
                    None => Err(error),
                }
            }
        }
    }

    /// Drops every entry of `room_id`. Returns how many were invalidated.
    ///
    /// Idle slots are removed. A slot whose lock is held keeps its place so
    /// queued callers stay behind the running fetch; it is marked and its
    /// entry is discarded by the next holder.
    pub fn invalidate(&self, room_id: &str) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut invalidated = 0;
        let mut busy = 0;
        slots.retain(|key, slot| {
            if key.room_id != room_id {
                return true;
            }
            invalidated += 1;
            match slot.state.try_lock() {
                Ok(_) => false,
                Err(_) => {
                    slot.invalidated.store(true, Ordering::Release);
                    busy += 1;
                    true
                }
            }
        });
        debug!(room_id, invalidated, busy, "invalidated cache entries");
        invalidated
    }

    /// Removes slots unused for longer than the idle limit.
    ///
    /// Slots with a fetch in progress are kept.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, slot| match slot.state.try_lock() {
            Ok(state) => now.saturating_duration_since(state.last_access) <= self.idle_limit,
            Err(_) => true,
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(removed, remaining = slots.len(), "swept idle cache entries");
        }
        removed
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            fetch_errors: self.counters.fetch_errors.load(Ordering::Relaxed),
        }
    }

    /// Whether `slot` is still the one stored under `key`.
    fn holds(&self, key: &CacheKey, slot: &Arc<Slot>) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn slot(&self, key: CacheKey) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new(Instant::now())))
            .clone()
    }
}
