//! failsafe-core Library
//!
//! Circuit breaker with O(1) rolling statistics for protecting calls to
//! unreliable dependencies.
//!
//! # Features
//!
//! - **Sliding windows**: count-based (last N calls) or time-based (last N
//!   seconds), both recorded and read in constant time
//! - **Five-state breaker**: CLOSED, OPEN, HALF_OPEN, FORCED_OPEN, DISABLED,
//!   swapped atomically and never locked on the call path
//! - **Slow-call detection**: trips on slow-call rate as well as failure rate
//! - **Typed events**: subscribe by kind, inspect a bounded history
//! - **Registry**: named breakers configured from YAML and `FAILSAFE_*` env vars
//!
//! # Example
//!
//! ```
//! use failsafe_core::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("inventory", &CircuitBreakerConfig::default())?;
//! let stock = breaker.execute(|| "42".parse::<u32>());
//! assert_eq!(stock.ok(), Some(42));
//! # Ok::<(), failsafe_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod ring_buffer;
pub mod simulation;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CircuitBreakerConfig, Config};
pub use error::{CallError, Error, Result};
pub use failsafe::{
    CircuitBreaker, CircuitBreakerEvent, CircuitBreakerRegistry, CircuitState, EventKind,
    EventPayload, Metrics,
};
pub use ring_buffer::EvictingRingBuffer;
pub use window::{Outcome, SlidingWindowType, Snapshot, StatsWindow};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr so reports on stdout stay machine-readable.
/// `RUST_LOG` overrides `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        Some("text") | None => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        Some(other) => {
            return Err(Error::Config(format!(
                "Unknown log format '{other}' (expected text or json)"
            )));
        }
    };
    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
