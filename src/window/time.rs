//! Window over the last N wall-clock seconds

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{CallAggregation, Outcome, Snapshot, StatsWindow, TotalAggregation};
use crate::clock::Clock;

/// Sliding window holding the calls of the last `size` seconds.
///
/// One bucket per second. Both recording and reading fast-forward the ring
/// to the current second first, so an idle window decays to empty.
#[derive(Debug)]
pub struct TimeWindow {
    ring: Mutex<TimeRing>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PartialAggregation {
    epoch_second: i64,
    calls: CallAggregation,
}

#[derive(Debug)]
struct TimeRing {
    buckets: Box<[PartialAggregation]>,
    head: usize,
    total: TotalAggregation,
}

impl TimeRing {
    /// Rotate until the head bucket is tagged with `now`.
    ///
    /// Every passed bucket is visited, even for seconds without calls, so
    /// its stale contents leave the total. Gaps longer than the window are
    /// capped to one full rotation.
    fn advance_to(&mut self, now: i64) {
        let elapsed = now - self.buckets[self.head].epoch_second;
        // same second, or the clock stepped backwards
        if elapsed <= 0 {
            return;
        }
        let len = self.buckets.len();
        let steps = elapsed.min(i64::try_from(len).unwrap_or(i64::MAX));
        for remaining in (0..steps).rev() {
            self.head = (self.head + 1) % len;
            let bucket = &mut self.buckets[self.head];
            self.total.subtract(&bucket.calls);
            bucket.calls.reset();
            bucket.epoch_second = now - remaining;
        }
    }
}

impl TimeWindow {
    /// Create a window over the last `size` seconds.
    pub fn new(size: NonZeroUsize, clock: Arc<dyn Clock>) -> Self {
        let now = clock.epoch_second();
        let bucket = PartialAggregation {
            epoch_second: now,
            calls: CallAggregation::default(),
        };
        Self {
            ring: Mutex::new(TimeRing {
                buckets: vec![bucket; size.get()].into_boxed_slice(),
                head: 0,
                total: TotalAggregation::default(),
            }),
            clock,
        }
    }

    /// Window length in seconds.
    pub fn size(&self) -> usize {
        self.ring.lock().buckets.len()
    }
}

impl StatsWindow for TimeWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let now = self.clock.epoch_second();
        let mut ring = self.ring.lock();
        ring.total.add(duration, outcome);
        ring.advance_to(now);
        let head = ring.head;
        ring.buckets[head].calls.record(duration, outcome);
        Snapshot::from_total(&ring.total)
    }

    fn snapshot(&self) -> Snapshot {
        let now = self.clock.epoch_second();
        let mut ring = self.ring.lock();
        ring.advance_to(now);
        Snapshot::from_total(&ring.total)
    }
}
