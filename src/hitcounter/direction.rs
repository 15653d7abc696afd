//! Directions: named, independently configured hit-rate dimensions.

use serde::Serialize;
use std::time::{Duration, Instant};

use super::store::{ShardedStore, Verdict};
use super::value::{TrackedValue, ValueKind};
use crate::error::{FencerError, Result};

/// Cleanup interval used when a direction does not set one.
pub const DEFAULT_CLEAN_UP_INTERVAL: Duration = Duration::from_secs(60);

/// Validated settings for a single direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionSettings {
    /// Routing name, unique within an engine
    pub name: String,
    /// Kind of value tracked
    pub kind: ValueKind,
    /// Trailing interval over which hits are counted
    pub window: Duration,
    /// Hits allowed per value within the window
    pub max_hits: u64,
    /// Period of the background cleanup sweep
    pub clean_up_interval: Duration,
    /// Maximum distinct values held at once, 0 for unlimited
    pub max_tracked: usize,
}

impl DirectionSettings {
    /// Settings with the default cleanup interval and no tracking cap.
    pub fn new(name: impl Into<String>, kind: ValueKind, window: Duration, max_hits: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            window,
            max_hits,
            clean_up_interval: DEFAULT_CLEAN_UP_INTERVAL,
            max_tracked: 0,
        }
    }

    pub fn with_clean_up_interval(mut self, interval: Duration) -> Self {
        self.clean_up_interval = interval;
        self
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    /// Every problem with these settings.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.is_empty() {
            problems.push("direction name must not be empty".to_string());
        }
        if self.window.is_zero() {
            problems.push(format!("direction \"{}\": window size must be > 0", self.name));
        }
        if self.max_hits == 0 {
            problems.push(format!("direction \"{}\": max hits must be > 0", self.name));
        }
        if self.clean_up_interval.is_zero() {
            problems.push(format!("direction \"{}\": clean up time must be > 0", self.name));
        }
        problems
    }
}

/// A direction bound to its store.
#[derive(Debug)]
pub struct Direction {
    settings: DirectionSettings,
    store: ShardedStore,
}

impl Direction {
    /// Build a direction, refusing invalid settings.
    pub fn new(settings: DirectionSettings) -> Result<Self> {
        let problems = settings.problems();
        if !problems.is_empty() {
            return Err(FencerError::InvalidConfig(problems));
        }

        let store = ShardedStore::new(settings.window, settings.max_hits, settings.max_tracked);
        Ok(Self { settings, store })
    }

    /// Record a hit and decide whether it is within the allowed rate.
    ///
    /// A value of the wrong kind never reaches the store.
    pub fn hit(&self, now: Instant, value: TrackedValue) -> Verdict {
        if value.kind() != self.settings.kind {
            return Verdict::WrongKind;
        }
        self.store.record_hit(now, value)
    }

    /// Evict values whose window has fully elapsed.
    pub fn clean_up(&self, now: Instant) -> usize {
        self.store.clean_up(now)
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn kind(&self) -> ValueKind {
        self.settings.kind
    }

    pub fn settings(&self) -> &DirectionSettings {
        &self.settings
    }

    pub fn store(&self) -> &ShardedStore {
        &self.store
    }

    /// A point-in-time view for dashboards.
    pub fn stats(&self) -> DirectionStats {
        DirectionStats {
            name: self.settings.name.clone(),
            kind: self.settings.kind,
            window_secs: self.settings.window.as_secs_f64(),
            max_hits: self.settings.max_hits,
            max_tracked: self.settings.max_tracked,
            tracked: self.store.len(),
        }
    }
}

/// Snapshot of one direction's configuration and load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionStats {
    pub name: String,
    pub kind: ValueKind,
    pub window_secs: f64,
    pub max_hits: u64,
    pub max_tracked: usize,
    pub tracked: usize,
}
