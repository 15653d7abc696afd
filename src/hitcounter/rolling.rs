//! Bucketed rolling count for the aggregate throughput metric.
//!
//! The count is approximate: an event is attributed to whichever bucket is
//! current when it arrives, so the trailing span is only accurate to one
//! bucket width. It is never used for rate decisions.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Number of buckets used by [`RollingCount::daily`].
pub const DEFAULT_BUCKETS: usize = 128;
/// Span covered by [`RollingCount::daily`].
pub const DEFAULT_SPAN: Duration = Duration::from_secs(24 * 60 * 60);

/// A fixed-bucket rolling sum over a trailing span of time.
#[derive(Debug)]
pub struct RollingCount {
    bucket_width: Duration,
    state: Mutex<RollingState>,
}

#[derive(Debug)]
struct RollingState {
    buckets: Vec<u64>,
    /// Index of the bucket receiving events right now
    head: usize,
    /// When the head bucket started
    head_start: Instant,
}

impl RollingCount {
    /// Create a counter of `buckets` buckets covering `span`, starting at `start`.
    pub fn new(buckets: usize, span: Duration, start: Instant) -> Self {
        let buckets = buckets.max(1);
        let bucket_width = (span / buckets as u32).max(Duration::from_nanos(1));
        Self {
            bucket_width,
            state: Mutex::new(RollingState {
                buckets: vec![0; buckets],
                head: 0,
                head_start: start,
            }),
        }
    }

    /// 128 buckets over the last 24 hours.
    pub fn daily(start: Instant) -> Self {
        Self::new(DEFAULT_BUCKETS, DEFAULT_SPAN, start)
    }

    /// Width of a single bucket.
    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    /// Record one event at `now`.
    pub fn inc(&self, now: Instant) {
        let mut state = self.state.lock();
        self.rotate(&mut state, now);
        let head = state.head;
        state.buckets[head] += 1;
    }

    /// Sum of events across the trailing span as seen at `now`.
    pub fn total(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.rotate(&mut state, now);
        state.buckets.iter().sum()
    }

    /// Advance the head to the bucket containing `now`, clearing every
    /// bucket that aged out on the way.
    fn rotate(&self, state: &mut RollingState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.head_start);
        let steps = (elapsed.as_nanos() / self.bucket_width.as_nanos()) as u64;
        if steps == 0 {
            return;
        }

        let len = state.buckets.len();
        if steps >= len as u64 {
            state.buckets.iter_mut().for_each(|b| *b = 0);
            state.head = 0;
        } else {
            for _ in 0..steps {
                state.head = (state.head + 1) % len;
                let head = state.head;
                state.buckets[head] = 0;
            }
        }

        state.head_start += self.bucket_width * steps.min(u32::MAX as u64) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_bucket_width() {
        let count = RollingCount::daily(Instant::now());
        // 24h / 128 = 11.25 minutes
        assert_eq!(count.bucket_width(), Duration::from_millis(675_000));
    }

    #[test]
    fn test_counts_within_span() {
        let start = Instant::now();
        let count = RollingCount::new(4, Duration::from_secs(40), start);

        count.inc(start);
        count.inc(start + Duration::from_secs(5));
        count.inc(start + Duration::from_secs(15));

        assert_eq!(count.total(start + Duration::from_secs(20)), 3);
    }

    #[test]
    fn test_old_buckets_age_out() {
        let start = Instant::now();
        let count = RollingCount::new(4, Duration::from_secs(40), start);

        count.inc(start);
        count.inc(start + Duration::from_secs(12));

        // The first bucket [0, 10) is gone once four buckets have passed it
        assert_eq!(count.total(start + Duration::from_secs(41)), 1);
        assert_eq!(count.total(start + Duration::from_secs(51)), 0);
    }

    #[test]
    fn test_long_idle_clears_everything() {
        let start = Instant::now();
        let count = RollingCount::new(4, Duration::from_secs(40), start);

        for _ in 0..10 {
            count.inc(start);
        }
        assert_eq!(count.total(start + Duration::from_secs(1000)), 0);

        count.inc(start + Duration::from_secs(1000));
        assert_eq!(count.total(start + Duration::from_secs(1001)), 1);
    }

    #[test]
    fn test_earlier_instant_does_not_rewind() {
        let start = Instant::now() + Duration::from_secs(100);
        let count = RollingCount::new(4, Duration::from_secs(40), start);

        count.inc(start);
        count.inc(start - Duration::from_secs(50));
        assert_eq!(count.total(start), 2);
    }
}
