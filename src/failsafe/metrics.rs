//! Per-state call metrics and threshold evaluation

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::window::{self, Outcome, SlidingWindowType, Snapshot, StatsWindow};

/// Public view of a breaker's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Metrics {
    /// Failure rate (percent) over the buffered calls
    pub failure_rate: f32,
    /// Slow-call rate (percent) over the buffered calls
    pub slow_call_rate: f32,
    /// Calls currently in the window
    pub number_of_buffered_calls: u32,
    /// Failed calls in the window
    pub number_of_failed_calls: u32,
    /// Successful calls in the window
    pub number_of_successful_calls: u32,
    /// Slow calls in the window
    pub number_of_slow_calls: u32,
    /// Slow calls that failed
    pub number_of_slow_failed_calls: u32,
    /// Slow calls that succeeded
    pub number_of_slow_successful_calls: u32,
    /// Calls rejected since the current state was entered
    pub number_of_not_permitted_calls: u64,
}

/// Result of comparing a snapshot against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Verdict {
    /// Not enough calls to judge
    BelowMinimumCalls,
    /// Enough calls, all rates under their thresholds
    BelowThresholds,
    /// At least one rate reached its threshold
    AboveThresholds {
        failure_rate: Option<f32>,
        slow_call_rate: Option<f32>,
    },
}

/// Thresholds a [`BreakerMetrics`] evaluates against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Thresholds {
    pub minimum_number_of_calls: u32,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub slow_call_duration: Duration,
}

/// Window plus rejection counter owned by one breaker state.
#[derive(Debug)]
pub(crate) struct BreakerMetrics {
    window: Box<dyn StatsWindow>,
    thresholds: Thresholds,
    not_permitted: AtomicU64,
}

impl BreakerMetrics {
    pub fn new(
        kind: SlidingWindowType,
        size: NonZeroU32,
        thresholds: Thresholds,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            window: window::new_window(kind, size, clock),
            thresholds,
            not_permitted: AtomicU64::new(0),
        }
    }

    /// Record a finished call and judge the resulting snapshot.
    pub fn record(&self, duration: Duration, failed: bool) -> Verdict {
        let slow = duration > self.thresholds.slow_call_duration;
        let snapshot = self.window.record(duration, Outcome::of(slow, failed));
        self.verdict(&snapshot)
    }

    pub fn on_call_not_permitted(&self) {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> Metrics {
        let snapshot = self.window.snapshot();
        Metrics {
            failure_rate: snapshot.failure_rate,
            slow_call_rate: snapshot.slow_call_rate,
            number_of_buffered_calls: snapshot.total_calls,
            number_of_failed_calls: snapshot.failed_calls,
            number_of_successful_calls: snapshot.successful_calls(),
            number_of_slow_calls: snapshot.slow_calls,
            number_of_slow_failed_calls: snapshot.slow_failed_calls,
            number_of_slow_successful_calls: snapshot.slow_successful_calls(),
            number_of_not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    fn verdict(&self, snapshot: &Snapshot) -> Verdict {
        if snapshot.total_calls < self.thresholds.minimum_number_of_calls {
            return Verdict::BelowMinimumCalls;
        }
        let failure_rate = (snapshot.failure_rate >= self.thresholds.failure_rate)
            .then_some(snapshot.failure_rate);
        let slow_call_rate = (snapshot.slow_call_rate >= self.thresholds.slow_call_rate)
            .then_some(snapshot.slow_call_rate);
        if failure_rate.is_none() && slow_call_rate.is_none() {
            Verdict::BelowThresholds
        } else {
            Verdict::AboveThresholds {
                failure_rate,
                slow_call_rate,
            }
        }
    }
}
