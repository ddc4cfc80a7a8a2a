//! Circuit breaker state machine
//!
//! The live state is an immutable [`BreakerState`] behind an [`ArcSwap`].
//! Transitions build a new state and install it with compare-and-swap; the
//! caller that wins the swap announces the transition, everyone else
//! re-reads. Permission checks never block and never sleep: the open wait is
//! compared against the clock by whoever asks next.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::classifier::{Classification, ErrorClassifier};
use super::events::{CircuitBreakerEvent, EventPayload, EventPublisher};
use super::metrics::{Metrics, Verdict};
use super::state::{BreakerState, Settings};
use crate::clock::{self, Clock};
use crate::config::CircuitBreakerConfig;
use crate::error::CallError;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow and are recorded
    Closed,
    /// Calls are rejected until the wait duration has elapsed
    Open,
    /// A limited number of probe calls decide between closed and open
    HalfOpen,
    /// Calls are rejected until the breaker is closed manually
    ForcedOpen,
    /// Calls flow and nothing is recorded
    Disabled,
}

impl CircuitState {
    /// Upper-case name, as used in events and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
            Self::ForcedOpen => "FORCED_OPEN",
            Self::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker protecting one downstream dependency.
///
/// Share it by `Arc`; every method takes `&self`.
pub struct CircuitBreaker {
    name: String,
    settings: Settings,
    classifier: ErrorClassifier,
    state: ArcSwap<BreakerState>,
    events: EventPublisher<CircuitBreakerEvent>,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock that records every error.
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Result<Self> {
        Self::builder(name).config(config.clone()).build()
    }

    /// Start building a breaker.
    #[must_use]
    pub fn builder(name: &str) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder::new(name)
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.settings.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.load().kind()
    }

    /// Statistics of the current state.
    ///
    /// An open breaker reports the window that tripped it.
    pub fn metrics(&self) -> Metrics {
        self.state.load().metrics().metrics()
    }

    /// Event publisher, for subscribing by kind.
    pub fn events(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.events
    }

    /// Subscribe to every event this breaker emits.
    pub fn on_event(&self, consumer: impl Fn(&CircuitBreakerEvent) + Send + Sync + 'static) {
        self.events.on_event(consumer);
    }

    /// Most recent events, oldest first.
    pub fn event_history(&self) -> Vec<CircuitBreakerEvent> {
        self.events.history()
    }

    /// Ask to run one call. Never blocks.
    ///
    /// A rejected call is counted and announced as not permitted.
    pub fn try_acquire_permission(&self) -> bool {
        match self.acquire() {
            Ok(_) => true,
            Err(state) => {
                self.reject(&state);
                false
            }
        }
    }

    /// Like [`try_acquire_permission`](Self::try_acquire_permission), with
    /// the rejection as an error.
    pub fn acquire_permission(&self) -> Result<()> {
        self.grant().map(|_| ())
    }

    /// Hand back a permission that was acquired but not used.
    ///
    /// Only a half-open breaker tracks permissions; elsewhere this is a no-op.
    /// The permit goes to the state current at the time of the call, so
    /// hand it back before the breaker can move on. [`execute`](Self::execute)
    /// and [`execute_async`](Self::execute_async) return permits to the state
    /// that granted them.
    pub fn release_permission(&self) {
        self.state
            .load()
            .release_permit(self.settings.half_open_calls.get());
    }

    /// Report a permitted call that succeeded.
    pub fn on_success(&self, duration: Duration) {
        trace!(breaker = %self.name, ?duration, "Call succeeded");
        self.publish(EventPayload::Success { elapsed: duration });
        self.record(duration, false);
    }

    /// Report a permitted call that failed.
    ///
    /// An ignored error hands the permission back to the current state, as
    /// [`release_permission`](Self::release_permission) does.
    pub fn on_error(&self, duration: Duration, error: &(dyn StdError + 'static)) {
        self.report_error(&self.state.load_full(), duration, error);
    }

    /// Reports an error for a call permitted by `granted`. Ignored errors
    /// return the permit to `granted` only.
    fn report_error(
        &self,
        granted: &BreakerState,
        duration: Duration,
        error: &(dyn StdError + 'static),
    ) {
        match self.classifier.classify(error) {
            Classification::Recorded => {
                trace!(breaker = %self.name, ?duration, %error, "Call failed");
                self.publish(EventPayload::Error {
                    elapsed: duration,
                    error: error.to_string(),
                });
                self.record(duration, true);
            }
            Classification::Ignored => {
                trace!(breaker = %self.name, %error, "Call failed with ignored error");
                granted.release_permit(self.settings.half_open_calls.get());
                self.publish(EventPayload::IgnoredError {
                    elapsed: duration,
                    error: error.to_string(),
                });
            }
            Classification::Success => self.on_success(duration),
        }
    }

    /// Run `call` under the breaker.
    ///
    /// The call is skipped when no permission is granted. Its duration and
    /// outcome are reported; a panic inside `call` hands the permission back.
    pub fn execute<T, E, F>(&self, call: F) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: StdError + 'static,
    {
        let granted = self.grant().map_err(CallError::Rejected)?;
        let guard = PermitGuard::new(self, granted);
        let start = Instant::now();
        let result = call();
        guard.finish(start.elapsed(), result)
    }

    /// Await `call` under the breaker.
    ///
    /// Dropping the returned future before `call` completes hands the
    /// permission back without recording anything.
    pub async fn execute_async<T, E, Fut>(&self, call: Fut) -> std::result::Result<T, CallError<E>>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        let granted = self.grant().map_err(CallError::Rejected)?;
        let guard = PermitGuard::new(self, granted);
        let start = Instant::now();
        let result = call.await;
        guard.finish(start.elapsed(), result)
    }

    /// Move to CLOSED with a fresh window.
    pub fn transition_to_closed_state(&self) {
        let from = self.transition_with(|_| self.settings.closed_state());
        self.announce(from, CircuitState::Closed);
    }

    /// Move to OPEN, keeping the current statistics for reporting.
    pub fn transition_to_open_state(&self) {
        let from = self.transition_with(|current| {
            self.settings.open_state(Arc::clone(current.metrics()))
        });
        self.announce(from, CircuitState::Open);
    }

    /// Move from OPEN to HALF_OPEN without waiting.
    pub fn transition_to_half_open_state(&self) -> Result<()> {
        loop {
            let current = self.state.load_full();
            if current.kind() != CircuitState::Open {
                return Err(Error::IllegalStateTransition {
                    name: self.name.clone(),
                    from: current.kind(),
                    to: CircuitState::HalfOpen,
                });
            }
            if self
                .compare_and_set(&current, self.settings.half_open_state())
                .is_some()
            {
                self.announce(CircuitState::Open, CircuitState::HalfOpen);
                return Ok(());
            }
        }
    }

    /// Reject every call until closed manually.
    pub fn transition_to_forced_open_state(&self) {
        let from = self.transition_with(|_| self.settings.forced_open_state());
        self.announce(from, CircuitState::ForcedOpen);
    }

    /// Let every call through without recording anything.
    pub fn transition_to_disabled_state(&self) {
        let from = self.transition_with(|_| self.settings.disabled_state());
        self.announce(from, CircuitState::Disabled);
    }

    /// Return to CLOSED with an empty window, from any state.
    pub fn reset(&self) {
        let from = self.transition_with(|_| self.settings.closed_state());
        if from != CircuitState::Closed {
            self.announce(from, CircuitState::Closed);
        }
        info!(breaker = %self.name, "Circuit breaker reset");
        self.publish(EventPayload::Reset);
    }

    /// One-line, human-readable description of the current state.
    pub fn status_message(&self) -> String {
        let state = self.state.load();
        let name = &self.name;
        match &**state {
            BreakerState::Closed { .. } => format!("Circuit breaker '{name}' is closed"),
            BreakerState::Open { metrics, retry_at } => {
                let wait_ms = retry_at.saturating_sub(self.settings.clock.epoch_millis()).max(0);
                let wait_secs = (wait_ms + 999) / 1000;
                format!(
                    "Circuit breaker '{name}' is open after a {:.1}% failure rate, retry in {wait_secs} seconds",
                    metrics.metrics().failure_rate
                )
            }
            BreakerState::HalfOpen { .. } => format!(
                "Circuit breaker '{name}' is half-open, testing recovery with {} of {} probe calls left",
                state.remaining_permits().unwrap_or(0),
                self.settings.half_open_calls
            ),
            BreakerState::ForcedOpen { .. } => {
                format!("Circuit breaker '{name}' is forced open until closed manually")
            }
            BreakerState::Disabled { .. } => {
                format!("Circuit breaker '{name}' is disabled, calls are not recorded")
            }
        }
    }

    fn grant(&self) -> Result<Arc<BreakerState>> {
        self.acquire().map_err(|state| {
            self.reject(&state);
            Error::CallNotPermitted {
                name: self.name.clone(),
                state: state.kind(),
            }
        })
    }

    /// Decide on a permission, moving OPEN to HALF_OPEN or HALF_OPEN back to
    /// OPEN on the way. Returns the state that granted or rejected the call.
    fn acquire(&self) -> std::result::Result<Arc<BreakerState>, Arc<BreakerState>> {
        let mut current = self.state.load_full();
        for _ in 0..2 {
            match current.kind() {
                CircuitState::Closed | CircuitState::Disabled => return Ok(current),
                CircuitState::ForcedOpen => return Err(current),
                CircuitState::Open => {
                    let retry_at = current.retry_at().unwrap_or(i64::MAX);
                    if self.settings.clock.epoch_millis() < retry_at {
                        return Err(current);
                    }
                    // the winner installs the state with its own permit already taken
                    if let Some(next) =
                        self.compare_and_set(&current, self.settings.half_open_state_claimed())
                    {
                        self.announce(CircuitState::Open, CircuitState::HalfOpen);
                        return Ok(next);
                    }
                }
                CircuitState::HalfOpen => {
                    if !self.settings.half_open_expired(&current) {
                        return if current.try_take_permit() {
                            Ok(current)
                        } else {
                            Err(current)
                        };
                    }
                    let open = self.settings.open_state(Arc::clone(current.metrics()));
                    if self.compare_and_set(&current, open).is_some() {
                        warn!(breaker = %self.name, "No verdict within the half-open wait limit");
                        self.announce(CircuitState::HalfOpen, CircuitState::Open);
                        return Err(self.state.load_full());
                    }
                }
            }
            current = self.state.load_full();
        }
        Err(current)
    }

    fn reject(&self, state: &BreakerState) {
        state.metrics().on_call_not_permitted();
        trace!(breaker = %self.name, state = %state.kind(), "Call not permitted");
        self.publish(EventPayload::NotPermitted);
    }

    fn record(&self, duration: Duration, failed: bool) {
        let state = self.state.load_full();
        let Some(metrics) = state.recording_metrics() else {
            return;
        };
        let verdict = metrics.record(duration, failed);
        self.evaluate(&state, verdict);
    }

    fn evaluate(&self, state: &Arc<BreakerState>, verdict: Verdict) {
        match (state.kind(), verdict) {
            (
                CircuitState::Closed | CircuitState::HalfOpen,
                Verdict::AboveThresholds {
                    failure_rate,
                    slow_call_rate,
                },
            ) => {
                let open = self.settings.open_state(Arc::clone(state.metrics()));
                if self.compare_and_set(state, open).is_none() {
                    return;
                }
                if let Some(rate) = failure_rate {
                    warn!(breaker = %self.name, rate, "Failure rate threshold exceeded");
                    self.publish(EventPayload::FailureRateExceeded { rate });
                }
                if let Some(rate) = slow_call_rate {
                    warn!(breaker = %self.name, rate, "Slow call rate threshold exceeded");
                    self.publish(EventPayload::SlowCallRateExceeded { rate });
                }
                self.announce(state.kind(), CircuitState::Open);
            }
            (CircuitState::HalfOpen, Verdict::BelowThresholds) => {
                if self
                    .compare_and_set(state, self.settings.closed_state())
                    .is_some()
                {
                    self.announce(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            _ => {}
        }
    }

    /// Install a state built from the current one, retrying until the swap
    /// lands. Returns the replaced state.
    fn transition_with(&self, make: impl Fn(&BreakerState) -> BreakerState) -> CircuitState {
        loop {
            let current = self.state.load_full();
            if self.compare_and_set(&current, make(&*current)).is_some() {
                return current.kind();
            }
        }
    }

    fn compare_and_set(
        &self,
        expected: &Arc<BreakerState>,
        next: BreakerState,
    ) -> Option<Arc<BreakerState>> {
        let next = Arc::new(next);
        let previous = self.state.compare_and_swap(expected, Arc::clone(&next));
        Arc::ptr_eq(&*previous, expected).then_some(next)
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "Circuit breaker opened"),
            CircuitState::HalfOpen => debug!(breaker = %self.name, %from, "Circuit breaker half-open"),
            CircuitState::Closed => info!(breaker = %self.name, %from, "Circuit breaker closed"),
            CircuitState::ForcedOpen => {
                info!(breaker = %self.name, %from, "Circuit breaker forced open");
            }
            CircuitState::Disabled => info!(breaker = %self.name, %from, "Circuit breaker disabled"),
        }
        self.publish(EventPayload::StateTransition { from, to });
        match to {
            CircuitState::ForcedOpen => self.publish(EventPayload::ForcedOpen),
            CircuitState::Disabled => self.publish(EventPayload::Disabled),
            _ => {}
        }
    }

    fn publish(&self, payload: EventPayload) {
        self.events.publish(CircuitBreakerEvent::new(
            &self.name,
            self.settings.clock.now(),
            payload,
        ));
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.settings.config)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

/// Returns an acquired permission to the state that granted it, unless the
/// call's outcome was reported.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    granted: Arc<BreakerState>,
    armed: bool,
}

impl<'a> PermitGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, granted: Arc<BreakerState>) -> Self {
        Self {
            breaker,
            granted,
            armed: true,
        }
    }

    fn finish<T, E>(
        mut self,
        elapsed: Duration,
        result: std::result::Result<T, E>,
    ) -> std::result::Result<T, CallError<E>>
    where
        E: StdError + 'static,
    {
        self.armed = false;
        match result {
            Ok(value) => {
                self.breaker.on_success(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.breaker.report_error(&self.granted, elapsed, &e);
                Err(CallError::Failed(e))
            }
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(breaker = %self.breaker.name, "Call abandoned, releasing permission");
            self.granted
                .release_permit(self.breaker.settings.half_open_calls.get());
        }
    }
}

/// Builder for [`CircuitBreaker`].
#[derive(Debug)]
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    classifier: ErrorClassifier,
}

impl CircuitBreakerBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: CircuitBreakerConfig::default(),
            clock: clock::system(),
            classifier: ErrorClassifier::new(),
        }
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` for waits, time windows and event timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the error classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Record errors matching `predicate` as failures.
    #[must_use]
    pub fn record_error(
        mut self,
        predicate: impl Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = self.classifier.record_when(predicate);
        self
    }

    /// Ignore errors matching `predicate`.
    #[must_use]
    pub fn ignore_error(
        mut self,
        predicate: impl Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = self.classifier.ignore_when(predicate);
        self
    }

    /// Record errors of type `E` as failures.
    #[must_use]
    pub fn record_error_type<E: StdError + 'static>(mut self) -> Self {
        self.classifier = self.classifier.record_type::<E>();
        self
    }

    /// Ignore errors of type `E`.
    #[must_use]
    pub fn ignore_error_type<E: StdError + 'static>(mut self) -> Self {
        self.classifier = self.classifier.ignore_type::<E>();
        self
    }

    /// Validate the configuration and build a CLOSED breaker.
    pub fn build(self) -> Result<CircuitBreaker> {
        let history_size = self.config.event_history_size;
        let settings = Settings::new(self.config, self.clock)?;
        let state = ArcSwap::from_pointee(settings.closed_state());
        debug!(breaker = %self.name, config = ?settings.config, "Circuit breaker created");
        Ok(CircuitBreaker {
            events: EventPublisher::new(&self.name, history_size)?,
            name: self.name,
            settings,
            classifier: self.classifier,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::failsafe::events::{Event, EventKind};

    const MS: Duration = Duration::from_millis(1);
    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            minimum_number_of_calls: 4,
            sliding_window_size: 4,
            failure_rate_threshold: 50.0,
            permitted_number_of_calls_in_half_open_state: 3,
            wait_duration_in_open_state: WAIT,
            slow_call_duration_threshold: Duration::from_secs(1),
            ..CircuitBreakerConfig::default()
        }
    }

    fn breaker_with(config: CircuitBreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::at_epoch();
        let breaker = CircuitBreaker::builder("backend")
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (breaker, clock)
    }

    fn breaker() -> (CircuitBreaker, ManualClock) {
        breaker_with(config())
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.on_error(MS, &io::Error::other("boom"));
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..4 {
            fail(breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    fn kinds(breaker: &CircuitBreaker) -> Vec<EventKind> {
        breaker.event_history().iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn opens_when_failure_rate_reaches_threshold() {
        // GIVEN: minimum 4 calls, 50% threshold
        let (breaker, clock) = breaker();
        // WHEN: 2 successes and 2 errors
        breaker.on_success(MS);
        breaker.on_success(MS);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        // THEN: the breaker opens and rejects until the wait elapses
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire_permission());
        clock.advance(WAIT - MS);
        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.metrics().number_of_not_permitted_calls, 2);
        clock.advance(MS);
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn open_state_reports_tripping_window() {
        let (breaker, _) = breaker();
        trip(&breaker);
        let metrics = breaker.metrics();
        assert_eq!(metrics.number_of_buffered_calls, 4);
        assert_eq!(metrics.number_of_failed_calls, 4);
        assert!((metrics.failure_rate - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn half_open_grants_only_permitted_probes() {
        let (breaker, clock) = breaker();
        trip(&breaker);
        clock.advance(WAIT);
        assert!(breaker.try_acquire_permission());
        assert!(breaker.try_acquire_permission());
        assert!(breaker.try_acquire_permission());
        assert!(!breaker.try_acquire_permission());

        breaker.release_permission();
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn caller_that_moves_to_half_open_keeps_its_permit() {
        // GIVEN: a single half-open permit and the open wait elapsed
        let (breaker, clock) = breaker_with(CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 1,
            ..config()
        });
        trip(&breaker);
        clock.advance(WAIT);
        let breaker = Arc::new(breaker);
        let racer = Arc::new(Mutex::new(None));
        {
            let weak = Arc::downgrade(&breaker);
            let racer = Arc::clone(&racer);
            breaker.events().on(EventKind::StateTransition, move |event| {
                if !matches!(
                    event.payload,
                    EventPayload::StateTransition {
                        to: CircuitState::HalfOpen,
                        ..
                    }
                ) {
                    return;
                }
                let Some(breaker) = weak.upgrade() else {
                    return;
                };
                let granted = std::thread::spawn(move || breaker.try_acquire_permission())
                    .join()
                    .unwrap();
                *racer.lock() = Some(granted);
            });
        }

        // WHEN: another caller asks while the transition is being announced
        let first = breaker.try_acquire_permission();

        // THEN: the caller that performed OPEN -> HALF_OPEN holds the permit
        assert!(first);
        assert_eq!(*racer.lock(), Some(false));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.metrics().number_of_not_permitted_calls, 1);
    }

    #[test]
    fn ignored_error_from_closed_call_leaves_half_open_permits_alone() {
        // GIVEN: a call granted while CLOSED, still running
        let clock = ManualClock::at_epoch();
        let breaker = CircuitBreaker::builder("backend")
            .config(CircuitBreakerConfig {
                permitted_number_of_calls_in_half_open_state: 1,
                ..config()
            })
            .clock(Arc::new(clock.clone()))
            .ignore_error_type::<std::fmt::Error>()
            .build()
            .unwrap();

        let result = breaker.execute(|| {
            // WHEN: the breaker trips and reaches HALF_OPEN meanwhile
            trip(&breaker);
            breaker.transition_to_half_open_state().unwrap();
            assert!(breaker.try_acquire_permission());
            Err::<(), _>(std::fmt::Error)
        });

        // THEN: the ignored error does not add a second half-open permit
        assert!(!result.unwrap_err().is_rejected());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.try_acquire_permission());
    }

    #[test]
    fn successful_probes_close_the_breaker() {
        let (breaker, clock) = breaker();
        trip(&breaker);
        clock.advance(WAIT);
        for _ in 0..3 {
            assert!(breaker.try_acquire_permission());
        }
        breaker.on_success(MS);
        breaker.on_success(MS);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn failing_probes_reopen_the_breaker() {
        let (breaker, clock) = breaker();
        trip(&breaker);
        clock.advance(WAIT);
        for _ in 0..3 {
            assert!(breaker.try_acquire_permission());
        }
        breaker.on_success(MS);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire_permission());
    }

    #[test]
    fn slow_calls_trip_the_breaker() {
        let (breaker, _) = breaker_with(CircuitBreakerConfig {
            slow_call_rate_threshold: 75.0,
            ..config()
        });
        breaker.on_success(Duration::from_millis(1_500));
        breaker.on_success(Duration::from_secs(2));
        breaker.on_success(Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_success(Duration::from_secs(5));

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(kinds(&breaker).contains(&EventKind::SlowCallRateExceeded));
        assert!(!kinds(&breaker).contains(&EventKind::FailureRateExceeded));
    }

    #[test]
    fn reset_is_idempotent() {
        let (breaker, _) = breaker();
        trip(&breaker);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().number_of_buffered_calls, 0);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics(), Metrics::default());

        let history = kinds(&breaker);
        let resets = history.iter().filter(|k| **k == EventKind::Reset).count();
        let transitions = history
            .iter()
            .filter(|k| **k == EventKind::StateTransition)
            .count();
        assert_eq!(resets, 2);
        // CLOSED->OPEN, OPEN->CLOSED
        assert_eq!(transitions, 2);
    }

    #[test]
    fn forced_open_rejects_until_closed() {
        let (breaker, clock) = breaker();
        breaker.transition_to_forced_open_state();
        clock.advance(WAIT * 100);
        assert!(!breaker.try_acquire_permission());
        assert!(breaker.acquire_permission().unwrap_err().is_not_permitted());

        breaker.transition_to_closed_state();
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn disabled_breaker_records_nothing() {
        let (breaker, _) = breaker();
        breaker.transition_to_disabled_state();
        for _ in 0..10 {
            assert!(breaker.try_acquire_permission());
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Disabled);
        assert_eq!(breaker.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn half_open_only_reachable_from_open() {
        let (breaker, _) = breaker();
        let err = breaker.transition_to_half_open_state().unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalStateTransition {
                from: CircuitState::Closed,
                to: CircuitState::HalfOpen,
                ..
            }
        ));

        breaker.transition_to_open_state();
        breaker.transition_to_half_open_state().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_max_wait_reopens() {
        let (breaker, clock) = breaker_with(CircuitBreakerConfig {
            max_wait_duration_in_half_open_state: Duration::from_secs(5),
            ..config()
        });
        trip(&breaker);
        clock.advance(WAIT);
        assert!(breaker.try_acquire_permission());
        clock.advance(Duration::from_secs(5));

        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn ignored_errors_do_not_count() {
        let clock = ManualClock::at_epoch();
        let breaker = CircuitBreaker::builder("backend")
            .config(config())
            .clock(Arc::new(clock.clone()))
            .ignore_error(|e| {
                e.downcast_ref::<io::Error>()
                    .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
            })
            .build()
            .unwrap();

        for _ in 0..10 {
            breaker.on_error(MS, &io::Error::from(io::ErrorKind::NotFound));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().number_of_buffered_calls, 0);
        assert_eq!(kinds(&breaker).last(), Some(&EventKind::IgnoredError));
    }

    #[test]
    fn ignored_error_returns_half_open_permit() {
        let clock = ManualClock::at_epoch();
        let breaker = CircuitBreaker::builder("backend")
            .config(config())
            .clock(Arc::new(clock.clone()))
            .ignore_error_type::<std::fmt::Error>()
            .build()
            .unwrap();
        breaker.transition_to_open_state();
        breaker.transition_to_half_open_state().unwrap();
        for _ in 0..3 {
            assert!(breaker.try_acquire_permission());
        }
        breaker.on_error(MS, &std::fmt::Error);
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn events_follow_transition_order() {
        let (breaker, _) = breaker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            breaker.on_event(move |e| seen.lock().push(e.payload.clone()));
        }
        trip(&breaker);

        let seen = seen.lock();
        assert_eq!(seen.len(), 6);
        assert!(matches!(seen[3], EventPayload::Error { .. }));
        assert!(matches!(seen[4], EventPayload::FailureRateExceeded { rate } if (rate - 100.0).abs() < f32::EPSILON));
        assert_eq!(
            seen[5],
            EventPayload::StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            }
        );
    }

    #[test]
    fn execute_reports_outcomes() {
        let (breaker, _) = breaker();
        let value: std::result::Result<u32, CallError<io::Error>> = breaker.execute(|| Ok(7));
        assert_eq!(value.unwrap(), 7);

        for _ in 0..3 {
            let err = breaker
                .execute(|| Err::<(), _>(io::Error::other("down")))
                .unwrap_err();
            assert!(!err.is_rejected());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let err = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok::<(), io::Error>(())
            })
            .unwrap_err();
        assert!(err.is_rejected());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn panicking_call_returns_permit() {
        let (breaker, _) = breaker();
        breaker.transition_to_open_state();
        breaker.transition_to_half_open_state().unwrap();
        for _ in 0..3 {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _ = breaker.execute(|| -> std::result::Result<(), io::Error> { panic!("bug") });
            }));
            assert!(outcome.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn status_message_describes_state() {
        let (breaker, clock) = breaker();
        assert_eq!(breaker.status_message(), "Circuit breaker 'backend' is closed");

        trip(&breaker);
        clock.advance(Duration::from_millis(2_500));
        let message = breaker.status_message();
        assert!(message.contains("is open"));
        assert!(message.contains("100.0% failure rate"));
        assert!(message.contains("retry in 8 seconds"));

        clock.advance(WAIT);
        assert!(breaker.try_acquire_permission());
        let message = breaker.status_message();
        assert!(message.contains("half-open, testing recovery"));
        assert!(message.contains("2 of 3"));
    }

    #[test]
    fn invalid_config_fails_fast() {
        let result = CircuitBreaker::new(
            "backend",
            &CircuitBreakerConfig {
                sliding_window_size: 0,
                ..config()
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
