//! Immutable per-state data of a circuit breaker
//!
//! A transition installs a new [`BreakerState`] instead of mutating the
//! current one; only the half-open permit counter and the metrics inside
//! change while a state is live.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::CircuitState;
use super::metrics::{BreakerMetrics, Thresholds};
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::window::SlidingWindowType;
use crate::{Error, Result};

#[derive(Debug)]
pub(crate) enum BreakerState {
    Closed {
        metrics: Arc<BreakerMetrics>,
    },
    Open {
        /// Metrics of the state that tripped, kept for reporting
        metrics: Arc<BreakerMetrics>,
        /// Epoch millis from which a probe may be attempted
        retry_at: i64,
    },
    HalfOpen {
        metrics: Arc<BreakerMetrics>,
        /// Probe calls still available
        permits: AtomicU32,
        /// Epoch millis the state was entered
        entered_at: i64,
    },
    ForcedOpen {
        metrics: Arc<BreakerMetrics>,
    },
    Disabled {
        metrics: Arc<BreakerMetrics>,
    },
}

impl BreakerState {
    pub fn kind(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
            Self::ForcedOpen { .. } => CircuitState::ForcedOpen,
            Self::Disabled { .. } => CircuitState::Disabled,
        }
    }

    pub fn metrics(&self) -> &Arc<BreakerMetrics> {
        match self {
            Self::Closed { metrics }
            | Self::Open { metrics, .. }
            | Self::HalfOpen { metrics, .. }
            | Self::ForcedOpen { metrics }
            | Self::Disabled { metrics } => metrics,
        }
    }

    /// Metrics that finished calls are recorded into; only closed and half-open record.
    pub fn recording_metrics(&self) -> Option<&Arc<BreakerMetrics>> {
        match self {
            Self::Closed { metrics } | Self::HalfOpen { metrics, .. } => Some(metrics),
            _ => None,
        }
    }

    /// Epoch millis at which an open breaker may probe.
    pub fn retry_at(&self) -> Option<i64> {
        match self {
            Self::Open { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }

    pub fn try_take_permit(&self) -> bool {
        match self {
            Self::HalfOpen { permits, .. } => permits
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
                .is_ok(),
            _ => false,
        }
    }

    pub fn release_permit(&self, max: u32) {
        if let Self::HalfOpen { permits, .. } = self {
            let _ = permits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p < max).then_some(p + 1)
            });
        }
    }

    pub fn remaining_permits(&self) -> Option<u32> {
        match self {
            Self::HalfOpen { permits, .. } => Some(permits.load(Ordering::Acquire)),
            _ => None,
        }
    }
}

/// Validated configuration plus everything needed to build states.
#[derive(Debug)]
pub(crate) struct Settings {
    pub config: CircuitBreakerConfig,
    pub window_size: NonZeroU32,
    pub half_open_calls: NonZeroU32,
    pub clock: Arc<dyn Clock>,
}

impl Settings {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let window_size = NonZeroU32::new(config.sliding_window_size)
            .ok_or_else(|| Error::Config("sliding_window_size must be at least 1".to_string()))?;
        let half_open_calls = NonZeroU32::new(config.permitted_number_of_calls_in_half_open_state)
            .ok_or_else(|| {
                Error::Config(
                    "permitted_number_of_calls_in_half_open_state must be at least 1".to_string(),
                )
            })?;
        Ok(Self {
            config,
            window_size,
            half_open_calls,
            clock,
        })
    }

    pub fn closed_state(&self) -> BreakerState {
        BreakerState::Closed {
            metrics: self.sliding_metrics(),
        }
    }

    pub fn open_state(&self, metrics: Arc<BreakerMetrics>) -> BreakerState {
        let wait = millis(self.config.wait_duration_in_open_state);
        BreakerState::Open {
            metrics,
            retry_at: self.clock.epoch_millis().saturating_add(wait),
        }
    }

    /// Fresh probe window sized to the permitted calls; judged only once all have finished.
    pub fn half_open_state(&self) -> BreakerState {
        self.half_open_state_with(self.half_open_calls.get())
    }

    /// Half-open state with one permit already held by the caller that
    /// installs it.
    pub fn half_open_state_claimed(&self) -> BreakerState {
        self.half_open_state_with(self.half_open_calls.get() - 1)
    }

    fn half_open_state_with(&self, permits: u32) -> BreakerState {
        let probes = self.half_open_calls;
        BreakerState::HalfOpen {
            metrics: Arc::new(BreakerMetrics::new(
                SlidingWindowType::CountBased,
                probes,
                self.thresholds(probes.get()),
                Arc::clone(&self.clock),
            )),
            permits: AtomicU32::new(permits),
            entered_at: self.clock.epoch_millis(),
        }
    }

    pub fn forced_open_state(&self) -> BreakerState {
        BreakerState::ForcedOpen {
            metrics: self.sliding_metrics(),
        }
    }

    pub fn disabled_state(&self) -> BreakerState {
        BreakerState::Disabled {
            metrics: self.sliding_metrics(),
        }
    }

    /// Returns `true` once a half-open state has waited longer than allowed for a verdict.
    pub fn half_open_expired(&self, state: &BreakerState) -> bool {
        let max_wait = self.config.max_wait_duration_in_half_open_state;
        match state {
            BreakerState::HalfOpen { entered_at, .. } if !max_wait.is_zero() => {
                self.clock.epoch_millis().saturating_sub(*entered_at) >= millis(max_wait)
            }
            _ => false,
        }
    }

    fn sliding_metrics(&self) -> Arc<BreakerMetrics> {
        Arc::new(BreakerMetrics::new(
            self.config.sliding_window_type,
            self.window_size,
            self.thresholds(self.config.effective_minimum_number_of_calls()),
            Arc::clone(&self.clock),
        ))
    }

    fn thresholds(&self, minimum_number_of_calls: u32) -> Thresholds {
        Thresholds {
            minimum_number_of_calls,
            failure_rate: self.config.failure_rate_threshold,
            slow_call_rate: self.config.slow_call_rate_threshold,
            slow_call_duration: self.config.slow_call_duration_threshold,
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn settings(config: CircuitBreakerConfig) -> (Settings, ManualClock) {
        let clock = ManualClock::at_epoch();
        let settings = Settings::new(config, Arc::new(clock.clone())).unwrap();
        (settings, clock)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CircuitBreakerConfig {
            failure_rate_threshold: 0.0,
            ..CircuitBreakerConfig::default()
        };
        assert!(Settings::new(config, Arc::new(ManualClock::at_epoch())).is_err());
    }

    #[test]
    fn half_open_permits_are_bounded() {
        let (settings, _) = settings(CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 2,
            ..CircuitBreakerConfig::default()
        });
        let state = settings.half_open_state();

        assert!(state.try_take_permit());
        assert!(state.try_take_permit());
        assert!(!state.try_take_permit());

        state.release_permit(2);
        state.release_permit(2);
        state.release_permit(2);
        assert_eq!(state.remaining_permits(), Some(2));
    }

    #[test]
    fn claimed_half_open_state_holds_one_permit() {
        let (settings, _) = settings(CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 2,
            ..CircuitBreakerConfig::default()
        });
        let state = settings.half_open_state_claimed();
        assert_eq!(state.remaining_permits(), Some(1));

        state.release_permit(2);
        assert_eq!(state.remaining_permits(), Some(2));
    }

    #[test]
    fn open_state_schedules_retry() {
        let (settings, clock) = settings(CircuitBreakerConfig {
            wait_duration_in_open_state: Duration::from_secs(5),
            ..CircuitBreakerConfig::default()
        });
        clock.advance(Duration::from_secs(1));
        let closed = settings.closed_state();
        let open = settings.open_state(Arc::clone(closed.metrics()));

        assert_eq!(open.kind(), CircuitState::Open);
        assert_eq!(open.retry_at(), Some(6_000));
        assert!(Arc::ptr_eq(open.metrics(), closed.metrics()));
        assert!(open.recording_metrics().is_none());
        assert!(!open.try_take_permit());
    }

    #[test]
    fn half_open_expiry_needs_non_zero_max_wait() {
        let (unlimited, clock) = settings(CircuitBreakerConfig::default());
        let state = unlimited.half_open_state();
        clock.advance(Duration::from_secs(3_600));
        assert!(!unlimited.half_open_expired(&state));

        let (limited, clock) = settings(CircuitBreakerConfig {
            max_wait_duration_in_half_open_state: Duration::from_secs(10),
            ..CircuitBreakerConfig::default()
        });
        let state = limited.half_open_state();
        clock.advance(Duration::from_secs(9));
        assert!(!limited.half_open_expired(&state));
        clock.advance(Duration::from_secs(1));
        assert!(limited.half_open_expired(&state));
    }
}
