//! Sharded key-history store.
//!
//! Each tracked value owns a short history of hit instants. Values are
//! spread over independently locked shards by hash, so hits for different
//! values proceed in parallel while hits for the same value are serialized
//! by their shard lock. Cleanup takes the same shard locks.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::hash_map::RandomState;
use std::collections::VecDeque;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

use super::value::TrackedValue;

/// Default number of shards per store.
pub const DEFAULT_SHARDS: usize = 64;

/// Outcome of recording one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The hit is within the allowed rate
    Allowed,
    /// The value exceeded its maximum hits within the window
    OverLimit,
    /// The value is new and the store already tracks its maximum number of values
    AtCapacity,
    /// The value is not of the kind the direction tracks
    WrongKind,
}

impl Verdict {
    /// Whether the underlying action should be allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    /// Whether this outcome counts as an attack and must be audited.
    pub fn is_flagged(&self) -> bool {
        matches!(self, Verdict::OverLimit | Verdict::AtCapacity)
    }
}

/// Recent hits for one tracked value.
///
/// Only the newest `max_hits + 1` instants are kept. That is enough to
/// tell whether the window holds more than `max_hits` hits, and the
/// history never claims more hits than actually happened.
#[derive(Debug, Default)]
struct HitHistory {
    hits: VecDeque<Instant>,
}

impl HitHistory {
    fn record(&mut self, now: Instant, window: Duration, keep: usize) -> usize {
        self.hits.retain(|&at| in_window(at, now, window));
        self.hits.push_back(now);
        while self.hits.len() > keep {
            self.hits.pop_front();
        }
        self.hits.len()
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        !self.hits.iter().any(|&at| in_window(at, now, window))
    }
}

/// Whether a hit at `at` falls inside the half-open window `(now - window, now]`.
///
/// A hit exactly `window` old is outside. Hits stamped slightly after `now`
/// (a caller that read the clock later but locked the shard first) count as
/// inside.
fn in_window(at: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(at) < window
}

/// Concurrency-safe, memory-bounded hit storage for one direction.
pub struct ShardedStore<S = RandomState> {
    keys: DashMap<TrackedValue, HitHistory, S>,
    window: Duration,
    max_hits: u64,
    /// 0 means unlimited
    max_tracked: usize,
    /// Exact number of values admitted, across all shards
    tracked: AtomicUsize,
    shards: usize,
}

impl<S: BuildHasher + Clone> std::fmt::Debug for ShardedStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("window", &self.window)
            .field("max_hits", &self.max_hits)
            .field("max_tracked", &self.max_tracked)
            .field("tracked", &self.len())
            .finish()
    }
}

impl ShardedStore {
    /// Create a store with the default shard count.
    pub fn new(window: Duration, max_hits: u64, max_tracked: usize) -> Self {
        Self::with_shards(window, max_hits, max_tracked, DEFAULT_SHARDS)
    }

    /// Create a store with `shards` shards. The count is rounded up to a
    /// power of two, with a minimum of two.
    pub fn with_shards(window: Duration, max_hits: u64, max_tracked: usize, shards: usize) -> Self {
        Self::with_hasher(window, max_hits, max_tracked, shards, RandomState::new())
    }
}

impl<S: BuildHasher + Clone> ShardedStore<S> {
    /// Create a store whose values are placed in shards by `hasher`.
    pub fn with_hasher(
        window: Duration,
        max_hits: u64,
        max_tracked: usize,
        shards: usize,
        hasher: S,
    ) -> Self {
        let shards = shards.max(2).next_power_of_two();
        Self {
            keys: DashMap::with_hasher_and_shard_amount(hasher, shards),
            window,
            max_hits,
            max_tracked,
            tracked: AtomicUsize::new(0),
            shards,
        }
    }

    /// Record a hit for `value` at `now` and decide whether it is allowed.
    ///
    /// Only the shard owning `value` is locked. A value not yet tracked is
    /// refused without being stored once the store is at capacity.
    pub fn record_hit(&self, now: Instant, value: TrackedValue) -> Verdict {
        let keep = usize::try_from(self.max_hits.saturating_add(1)).unwrap_or(usize::MAX);

        let count = match self.keys.entry(value) {
            Entry::Occupied(mut entry) => entry.get_mut().record(now, self.window, keep),
            Entry::Vacant(entry) => {
                if !self.admit() {
                    trace!(value = %entry.key(), "Store at capacity, refusing new value");
                    return Verdict::AtCapacity;
                }
                let mut history = HitHistory::default();
                let count = history.record(now, self.window, keep);
                entry.insert(history);
                count
            }
        };

        if count as u64 <= self.max_hits {
            Verdict::Allowed
        } else {
            Verdict::OverLimit
        }
    }

    /// Remove every value with no hits inside the window as seen at `now`.
    ///
    /// Returns the number of values removed. Each removal frees its slot
    /// while the shard is still locked, so admissions running alongside the
    /// sweep see the room at once.
    pub fn clean_up(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.keys.retain(|_, history| {
            if history.is_expired(now, self.window) {
                self.tracked.fetch_sub(1, Ordering::SeqCst);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of hits for `value` inside the window at `now`, capped at `max_hits + 1`.
    pub fn hits_in_window(&self, now: Instant, value: &TrackedValue) -> usize {
        self.keys
            .get(value)
            .map(|history| {
                history
                    .hits
                    .iter()
                    .filter(|&&at| in_window(at, now, self.window))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of values currently tracked.
    pub fn len(&self) -> usize {
        self.tracked.load(Ordering::SeqCst)
    }

    /// Whether no values are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `value` currently has a history.
    pub fn contains(&self, value: &TrackedValue) -> bool {
        self.keys.contains_key(value)
    }

    /// Number of shards the key space is split over.
    pub fn shard_count(&self) -> usize {
        self.shards
    }

    /// Reserve a slot for a new value, respecting `max_tracked`.
    fn admit(&self) -> bool {
        if self.max_tracked == 0 {
            self.tracked.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        self.tracked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_tracked).then_some(n + 1)
            })
            .is_ok()
    }
}
