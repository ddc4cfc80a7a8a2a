//! Failsafe mechanisms: circuit breaker, error classification, events, registry

mod circuit_breaker;
mod classifier;
pub mod events;
mod metrics;
mod registry;
mod state;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerBuilder, CircuitState};
pub use classifier::{Classification, ErrorClassifier};
pub use events::{CircuitBreakerEvent, Event, EventKind, EventPayload, EventPublisher};
pub use metrics::Metrics;
pub use registry::{BreakerSummary, CircuitBreakerRegistry};
