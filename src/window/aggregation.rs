//! Counter bundles stored in window buckets

use std::time::Duration;

use super::Outcome;

/// Aggregated outcomes of the calls recorded into one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallAggregation {
    /// Sum of call durations in milliseconds
    pub total_duration_millis: u64,
    /// Calls recorded
    pub calls: u32,
    /// Calls slower than the slow-call threshold
    pub slow_calls: u32,
    /// Calls that were both slow and failed
    pub slow_failed_calls: u32,
    /// Calls that failed
    pub failed_calls: u32,
}

impl CallAggregation {
    /// Count one call.
    pub fn record(&mut self, duration: Duration, outcome: Outcome) {
        self.total_duration_millis += duration_millis(duration);
        self.calls += 1;
        match outcome {
            Outcome::Success => {}
            Outcome::Error => self.failed_calls += 1,
            Outcome::SlowSuccess => self.slow_calls += 1,
            Outcome::SlowError => {
                self.slow_calls += 1;
                self.failed_calls += 1;
                self.slow_failed_calls += 1;
            }
        }
        self.debug_check();
    }

    /// Zero every counter so the bucket can be reused.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Remove the contribution of `other`, which must be part of `self`.
    pub fn subtract(&mut self, other: &Self) {
        debug_assert!(
            self.calls >= other.calls
                && self.failed_calls >= other.failed_calls
                && self.slow_calls >= other.slow_calls
                && self.slow_failed_calls >= other.slow_failed_calls
                && self.total_duration_millis >= other.total_duration_millis,
            "bucket {other:?} is not contained in total {self:?}"
        );
        self.total_duration_millis -= other.total_duration_millis;
        self.calls -= other.calls;
        self.slow_calls -= other.slow_calls;
        self.slow_failed_calls -= other.slow_failed_calls;
        self.failed_calls -= other.failed_calls;
        self.debug_check();
    }

    /// Returns `true` when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls == 0
    }

    fn debug_check(&self) {
        debug_assert!(self.failed_calls <= self.calls);
        debug_assert!(self.slow_calls <= self.calls);
        debug_assert!(self.slow_failed_calls <= self.slow_calls.min(self.failed_calls));
    }
}

/// Running sum over every live bucket of a window.
///
/// Only ever changed incrementally: [`add`](Self::add) when a call is
/// recorded, [`subtract`](Self::subtract) when a bucket rotates out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalAggregation(CallAggregation);

impl TotalAggregation {
    /// Count one call.
    pub fn add(&mut self, duration: Duration, outcome: Outcome) {
        self.0.record(duration, outcome);
    }

    /// Drop a rotated-out bucket from the sum.
    pub fn subtract(&mut self, bucket: &CallAggregation) {
        self.0.subtract(bucket);
    }

    /// Current sum.
    #[must_use]
    pub fn get(&self) -> &CallAggregation {
        &self.0
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn slow_error_increments_every_counter() {
        let mut agg = CallAggregation::default();
        agg.record(Duration::from_millis(120), Outcome::SlowError);
        assert_eq!(
            agg,
            CallAggregation {
                total_duration_millis: 120,
                calls: 1,
                slow_calls: 1,
                slow_failed_calls: 1,
                failed_calls: 1,
            }
        );
    }

    #[test]
    fn outcomes_split_into_slow_and_failed() {
        let mut agg = CallAggregation::default();
        agg.record(Duration::from_millis(1), Outcome::Success);
        agg.record(Duration::from_millis(2), Outcome::Error);
        agg.record(Duration::from_millis(3), Outcome::SlowSuccess);
        assert_eq!(agg.calls, 3);
        assert_eq!(agg.failed_calls, 1);
        assert_eq!(agg.slow_calls, 1);
        assert_eq!(agg.slow_failed_calls, 0);
        assert_eq!(agg.total_duration_millis, 6);
    }

    #[test]
    fn subtract_restores_previous_total() {
        let mut bucket = CallAggregation::default();
        bucket.record(Duration::from_millis(10), Outcome::SlowError);

        let mut total = TotalAggregation::default();
        total.add(Duration::from_millis(5), Outcome::Success);
        total.add(Duration::from_millis(10), Outcome::SlowError);
        total.subtract(&bucket);

        assert_eq!(total.get().calls, 1);
        assert_eq!(total.get().failed_calls, 0);
        assert_eq!(total.get().total_duration_millis, 5);
    }

    #[test]
    fn reset_zeroes_bucket() {
        let mut agg = CallAggregation::default();
        agg.record(Duration::from_millis(10), Outcome::Error);
        agg.reset();
        assert!(agg.is_empty());
        assert_eq!(agg, CallAggregation::default());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is not contained in total")]
    fn subtract_past_zero_panics_in_debug() {
        let mut bucket = CallAggregation::default();
        bucket.record(Duration::ZERO, Outcome::Error);
        let mut total = TotalAggregation::default();
        total.subtract(&bucket);
    }
}
