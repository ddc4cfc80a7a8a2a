//! Window over the last N calls

use std::num::NonZeroUsize;
use std::time::Duration;

use parking_lot::Mutex;

use super::{CallAggregation, Outcome, Snapshot, StatsWindow, TotalAggregation};

/// Sliding window holding exactly the last `size` recorded calls.
///
/// Each bucket holds one call; recording overwrites the oldest bucket.
#[derive(Debug)]
pub struct CountWindow {
    ring: Mutex<CountRing>,
}

#[derive(Debug)]
struct CountRing {
    buckets: Box<[CallAggregation]>,
    head: usize,
    total: TotalAggregation,
}

impl CountWindow {
    /// Create a window over the last `size` calls.
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            ring: Mutex::new(CountRing {
                buckets: vec![CallAggregation::default(); size.get()].into_boxed_slice(),
                head: 0,
                total: TotalAggregation::default(),
            }),
        }
    }

    /// Number of calls the window retains.
    pub fn size(&self) -> usize {
        self.ring.lock().buckets.len()
    }
}

impl StatsWindow for CountWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let mut ring = self.ring.lock();
        ring.total.add(duration, outcome);

        let CountRing {
            buckets,
            head,
            total,
        } = &mut *ring;
        *head = (*head + 1) % buckets.len();
        let bucket = &mut buckets[*head];
        total.subtract(bucket);
        bucket.reset();
        bucket.record(duration, outcome);

        Snapshot::from_total(total)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::from_total(&self.ring.lock().total)
    }
}
