//! Rolling call statistics
//!
//! A window keeps a ring of buckets plus one running total. Recording adds
//! to the total and subtracts whatever bucket rotates out, so both
//! [`StatsWindow::record`] and [`StatsWindow::snapshot`] are O(1) in the
//! number of recorded calls.

mod aggregation;
mod count;
mod time;

pub use aggregation::{CallAggregation, TotalAggregation};
pub use count::CountWindow;
pub use time::TimeWindow;

use std::fmt;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Classification of a finished call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Fast and successful
    Success,
    /// Fast and failed
    Error,
    /// Successful but slower than the slow-call threshold
    SlowSuccess,
    /// Failed and slower than the slow-call threshold
    SlowError,
}

impl Outcome {
    /// Build an outcome from its two flags.
    #[must_use]
    pub fn of(slow: bool, failed: bool) -> Self {
        match (slow, failed) {
            (false, false) => Self::Success,
            (false, true) => Self::Error,
            (true, false) => Self::SlowSuccess,
            (true, true) => Self::SlowError,
        }
    }

    /// Returns `true` for the two error outcomes.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::SlowError)
    }

    /// Returns `true` for the two slow outcomes.
    #[must_use]
    pub fn is_slow(self) -> bool {
        matches!(self, Self::SlowSuccess | Self::SlowError)
    }
}

/// Kind of sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    /// Last N calls
    #[default]
    CountBased,
    /// Calls in the last N seconds
    TimeBased,
}

/// Rolling statistics over recent calls.
pub trait StatsWindow: Send + Sync + fmt::Debug {
    /// Record a finished call and return the statistics including it.
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot;

    /// Current statistics.
    fn snapshot(&self) -> Snapshot;
}

/// Build the window selected by `kind`; `size` is calls or seconds.
pub fn new_window(
    kind: SlidingWindowType,
    size: NonZeroU32,
    clock: Arc<dyn Clock>,
) -> Box<dyn StatsWindow> {
    let size = NonZeroUsize::try_from(size).unwrap_or(NonZeroUsize::MAX);
    match kind {
        SlidingWindowType::CountBased => Box::new(CountWindow::new(size)),
        SlidingWindowType::TimeBased => Box::new(TimeWindow::new(size, clock)),
    }
}

/// Immutable point-in-time view of a window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Snapshot {
    /// Sum of call durations
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    /// Mean call duration, zero without calls
    #[serde(with = "humantime_serde")]
    pub average_duration: Duration,
    /// Calls in the window
    pub total_calls: u32,
    /// Failed calls in the window
    pub failed_calls: u32,
    /// Slow calls in the window
    pub slow_calls: u32,
    /// Calls both slow and failed
    pub slow_failed_calls: u32,
    /// Percentage of failed calls (0–100)
    pub failure_rate: f32,
    /// Percentage of slow calls (0–100)
    pub slow_call_rate: f32,
}

impl Snapshot {
    /// Derive a snapshot from a running total.
    #[must_use]
    pub fn from_total(total: &TotalAggregation) -> Self {
        let agg = total.get();
        let total_duration = Duration::from_millis(agg.total_duration_millis);
        if agg.calls == 0 {
            return Self {
                total_duration,
                ..Self::default()
            };
        }
        Self {
            total_duration,
            average_duration: total_duration / agg.calls,
            total_calls: agg.calls,
            failed_calls: agg.failed_calls,
            slow_calls: agg.slow_calls,
            slow_failed_calls: agg.slow_failed_calls,
            failure_rate: percentage(agg.failed_calls, agg.calls),
            slow_call_rate: percentage(agg.slow_calls, agg.calls),
        }
    }

    /// Calls that did not fail.
    #[must_use]
    pub fn successful_calls(&self) -> u32 {
        self.total_calls - self.failed_calls
    }

    /// Slow calls that did not fail.
    #[must_use]
    pub fn slow_successful_calls(&self) -> u32 {
        self.slow_calls - self.slow_failed_calls
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: u32, whole: u32) -> f32 {
    part as f32 * 100.0 / whole as f32
}
