//! Typed event stream with bounded history
//!
//! Consumers subscribe either to every event or to one [`Event::Kind`].
//! Each publisher also keeps the most recent events in an
//! [`EvictingRingBuffer`] for inspection.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use super::CircuitState;
use crate::Result;
use crate::ring_buffer::EvictingRingBuffer;

/// An event that can be published through an [`EventPublisher`].
pub trait Event: Clone + Send + Sync + 'static {
    /// Closed set of event kinds consumers can subscribe to.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Kind of this event.
    fn kind(&self) -> Self::Kind;
}

type Consumer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of events to registered consumers.
pub struct EventPublisher<E: Event> {
    /// Name used in diagnostics
    name: String,
    all: RwLock<Vec<Consumer<E>>>,
    by_kind: RwLock<HashMap<E::Kind, Vec<Consumer<E>>>>,
    history: EvictingRingBuffer<E>,
}

impl<E: Event> EventPublisher<E> {
    /// Create a publisher that remembers the last `history_size` events.
    pub fn new(name: &str, history_size: usize) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            all: RwLock::new(Vec::new()),
            by_kind: RwLock::new(HashMap::new()),
            history: EvictingRingBuffer::new(history_size)?,
        })
    }

    /// Subscribe to every event.
    pub fn on_event(&self, consumer: impl Fn(&E) + Send + Sync + 'static) {
        self.all.write().push(Arc::new(consumer));
    }

    /// Subscribe to events of one kind.
    pub fn on(&self, kind: E::Kind, consumer: impl Fn(&E) + Send + Sync + 'static) {
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(consumer));
    }

    /// Returns `true` when at least one consumer is registered.
    pub fn has_consumers(&self) -> bool {
        !self.all.read().is_empty() || self.by_kind.read().values().any(|v| !v.is_empty())
    }

    /// Deliver `event` to its consumers and append it to the history.
    ///
    /// Consumers run on the calling thread, outside the publisher's locks.
    /// A panicking consumer is logged and skipped.
    pub fn publish(&self, event: E) {
        let kind = event.kind();
        let consumers: Vec<Consumer<E>> = {
            let all = self.all.read();
            let by_kind = self.by_kind.read();
            all.iter()
                .chain(by_kind.get(&kind).into_iter().flatten())
                .cloned()
                .collect()
        };

        for consumer in consumers {
            if catch_unwind(AssertUnwindSafe(|| consumer(&event))).is_err() {
                warn!(publisher = %self.name, kind = ?kind, "Event consumer panicked");
            }
        }

        self.history.push(event);
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<E> {
        self.history.snapshot_ordered()
    }

    /// Forget retained events.
    pub fn clear_history(&self) {
        self.history.clear();
    }
}

impl<E: Event> fmt::Debug for EventPublisher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("name", &self.name)
            .field("consumers", &self.all.read().len())
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

/// Kinds of circuit breaker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A permitted call succeeded
    Success,
    /// A permitted call failed and was recorded
    Error,
    /// A permitted call failed with an ignored error
    IgnoredError,
    /// A call was rejected
    NotPermitted,
    /// The breaker changed state
    StateTransition,
    /// The breaker was reset
    Reset,
    /// The breaker was forced open
    ForcedOpen,
    /// The breaker was disabled
    Disabled,
    /// The failure rate reached its threshold
    FailureRateExceeded,
    /// The slow-call rate reached its threshold
    SlowCallRateExceeded,
}

/// Type-specific data of a circuit breaker event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// A permitted call succeeded
    Success {
        /// Call duration
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    /// A permitted call failed and was recorded
    Error {
        /// Call duration
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
        /// Rendered error
        error: String,
    },
    /// A permitted call failed with an ignored error
    IgnoredError {
        /// Call duration
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
        /// Rendered error
        error: String,
    },
    /// A call was rejected
    NotPermitted,
    /// The breaker changed state
    StateTransition {
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// The breaker was reset
    Reset,
    /// The breaker was forced open
    ForcedOpen,
    /// The breaker was disabled
    Disabled,
    /// The failure rate reached its threshold
    FailureRateExceeded {
        /// Observed failure rate (percent)
        rate: f32,
    },
    /// The slow-call rate reached its threshold
    SlowCallRateExceeded {
        /// Observed slow-call rate (percent)
        rate: f32,
    },
}

/// Signal emitted by a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerEvent {
    /// Breaker that emitted the event
    pub breaker: String,
    /// When the event was created
    pub created_at: DateTime<Utc>,
    /// Event data
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CircuitBreakerEvent {
    /// Create an event.
    #[must_use]
    pub fn new(breaker: &str, created_at: DateTime<Utc>, payload: EventPayload) -> Self {
        Self {
            breaker: breaker.to_string(),
            created_at,
            payload,
        }
    }
}

impl Event for CircuitBreakerEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Success { .. } => EventKind::Success,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::IgnoredError { .. } => EventKind::IgnoredError,
            EventPayload::NotPermitted => EventKind::NotPermitted,
            EventPayload::StateTransition { .. } => EventKind::StateTransition,
            EventPayload::Reset => EventKind::Reset,
            EventPayload::ForcedOpen => EventKind::ForcedOpen,
            EventPayload::Disabled => EventKind::Disabled,
            EventPayload::FailureRateExceeded { .. } => EventKind::FailureRateExceeded,
            EventPayload::SlowCallRateExceeded { .. } => EventKind::SlowCallRateExceeded,
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let name = &self.breaker;
        match &self.payload {
            EventPayload::Success { elapsed } => write!(
                f,
                "{at}: CircuitBreaker '{name}' recorded a successful call. Elapsed time: {} ms",
                elapsed.as_millis()
            ),
            EventPayload::Error { elapsed, error } => write!(
                f,
                "{at}: CircuitBreaker '{name}' recorded an error: '{error}'. Elapsed time: {} ms",
                elapsed.as_millis()
            ),
            EventPayload::IgnoredError { elapsed, error } => write!(
                f,
                "{at}: CircuitBreaker '{name}' recorded an error which has been ignored: '{error}'. Elapsed time: {} ms",
                elapsed.as_millis()
            ),
            EventPayload::NotPermitted => {
                write!(f, "{at}: CircuitBreaker '{name}' recorded a call which was not permitted.")
            }
            EventPayload::StateTransition { from, to } => {
                write!(f, "{at}: CircuitBreaker '{name}' changed state from {from} to {to}")
            }
            EventPayload::Reset => write!(f, "{at}: CircuitBreaker '{name}' reset"),
            EventPayload::ForcedOpen => write!(f, "{at}: CircuitBreaker '{name}' forced open"),
            EventPayload::Disabled => write!(f, "{at}: CircuitBreaker '{name}' disabled"),
            EventPayload::FailureRateExceeded { rate } => write!(
                f,
                "{at}: CircuitBreaker '{name}' exceeded failure rate threshold. Current failure rate: {rate}"
            ),
            EventPayload::SlowCallRateExceeded { rate } => write!(
                f,
                "{at}: CircuitBreaker '{name}' exceeded slow call rate threshold. Current slow call rate: {rate}"
            ),
        }
    }
}
