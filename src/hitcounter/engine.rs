//! The hit counter: routes hits to directions and keeps them clean.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::audit::{AuditEntry, AuditLog, FlagReason, TracingAuditLog};
use super::clock::{Clock, SystemClock};
use super::direction::{Direction, DirectionSettings, DirectionStats};
use super::rolling::RollingCount;
use super::store::Verdict;
use super::value::TrackedValue;
use crate::error::{FencerError, Result};

/// Tracks hits across a fixed set of directions.
///
/// Construction spawns one cleanup task per direction on the current tokio
/// runtime, and fails outside one. The tasks stop on [`HitCounter::shutdown`] or
/// when the hit counter is dropped.
pub struct HitCounter {
    directions: HashMap<String, Arc<Direction>>,
    clock: Arc<dyn Clock>,
    count: RollingCount,
    audit: Arc<dyn AuditLog>,
    shutdown: watch::Sender<bool>,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HitCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitCounter")
            .field("directions", &self.directions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HitCounter {
    /// Create a hit counter on the system clock, auditing through `tracing`.
    pub fn new(directions: Vec<DirectionSettings>) -> Result<Self> {
        Self::with_parts(directions, Arc::new(SystemClock), Arc::new(TracingAuditLog))
    }

    /// Create a hit counter with an explicit clock and audit sink.
    ///
    /// Every invalid direction and every duplicated name is reported together.
    pub fn with_parts(
        directions: Vec<DirectionSettings>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| FencerError::Config(format!("hit counter needs a tokio runtime: {}", e)))?;

        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        let mut built = HashMap::with_capacity(directions.len());

        for settings in directions {
            if !seen.insert(settings.name.clone()) {
                problems.push(format!("duplicate direction name \"{}\"", settings.name));
                continue;
            }
            match Direction::new(settings) {
                Ok(direction) => {
                    built.insert(direction.name().to_string(), Arc::new(direction));
                }
                Err(e) => problems.extend(e.messages()),
            }
        }

        if !problems.is_empty() {
            return Err(FencerError::InvalidConfig(problems));
        }

        let (shutdown, _) = watch::channel(false);
        let count = RollingCount::daily(clock.now());
        let hit_counter = Self {
            directions: built,
            clock,
            count,
            audit,
            shutdown,
            cleanups: Mutex::new(Vec::new()),
        };
        hit_counter.schedule_clean_ups(&runtime);

        info!(
            directions = hit_counter.directions.len(),
            "Hit counter initialized"
        );
        Ok(hit_counter)
    }

    /// Handle one request: is this hit for `value` within the allowed rate?
    ///
    /// Unknown directions and values of the wrong kind are answered `false`
    /// like an attack, but are only logged as invalid. Every flagged hit
    /// produces exactly one audit record.
    pub fn handle_request(&self, direction: &str, value: TrackedValue) -> bool {
        let Some(dir) = self.directions.get(direction) else {
            warn!(
                direction = %direction,
                reason = "unknown direction",
                "Invalid request"
            );
            return false;
        };

        let now = self.clock.now();
        self.count.inc(now);

        let rendered = value.to_string();
        let verdict = dir.hit(now, value);
        trace!(direction = %direction, value = %rendered, verdict = ?verdict, "Hit recorded");

        if verdict.is_allowed() {
            return true;
        }
        if !verdict.is_flagged() {
            warn!(
                direction = %direction,
                expected = %dir.kind(),
                reason = "value kind mismatch",
                "Invalid request"
            );
            return false;
        }

        let reason = if verdict == Verdict::AtCapacity {
            FlagReason::CapacityExhausted
        } else {
            FlagReason::RateExceeded
        };

        debug!(direction = %direction, value = %rendered, reason = ?reason, "Hit flagged");
        self.audit.record(&AuditEntry::new(direction, rendered, reason));
        false
    }

    /// Look up a direction by name.
    pub fn direction(&self, name: &str) -> Option<&Arc<Direction>> {
        self.directions.get(name)
    }

    /// Names of all directions.
    pub fn direction_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.directions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Requests routed to a direction over the last 24 hours (approximate).
    pub fn requests_processed(&self) -> u64 {
        self.count.total(self.clock.now())
    }

    /// A point-in-time view for dashboards.
    pub fn stats(&self) -> EngineStats {
        let mut directions: Vec<DirectionStats> =
            self.directions.values().map(|d| d.stats()).collect();
        directions.sort_by(|a, b| a.name.cmp(&b.name));

        EngineStats {
            requests_last_24h: self.requests_processed(),
            directions,
        }
    }

    /// Stop every cleanup task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = std::mem::take(&mut *self.cleanups.lock());

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Cleanup task ended abnormally");
            }
        }
        info!("Hit counter stopped");
    }

    fn schedule_clean_ups(&self, runtime: &Handle) {
        let mut cleanups = self.cleanups.lock();
        for direction in self.directions.values() {
            let handle = runtime.spawn(run_clean_up(
                direction.clone(),
                self.clock.clone(),
                self.shutdown.subscribe(),
            ));
            cleanups.push(handle);
        }
    }
}

/// Sweep `direction` every cleanup interval until shutdown.
///
/// A panicking sweep is logged and the loop carries on, since a dead loop
/// would let the store grow without bound.
async fn run_clean_up(
    direction: Arc<Direction>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(direction.settings().clean_up_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(direction = %direction.name(), "Cleanup loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = clock.now();
        match std::panic::catch_unwind(AssertUnwindSafe(|| direction.clean_up(now))) {
            Ok(removed) => {
                trace!(
                    direction = %direction.name(),
                    removed = removed,
                    tracked = direction.store().len(),
                    "Cleanup sweep finished"
                );
            }
            Err(_) => {
                error!(direction = %direction.name(), "Cleanup sweep panicked");
            }
        }
    }

    debug!(direction = %direction.name(), "Cleanup loop stopped");
}

/// Snapshot of the whole hit counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub requests_last_24h: u64,
    pub directions: Vec<DirectionStats>,
}
