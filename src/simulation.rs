//! Deterministic workload driver for a single breaker
//!
//! Runs on a [`ManualClock`] that starts at the Unix epoch, so a simulation
//! of hours of traffic finishes instantly and the same inputs produce the
//! same report, timestamps included.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::cli::SimulateArgs;
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::failsafe::{
    CircuitBreakerEvent, CircuitBreakerRegistry, CircuitState, EventKind, EventPayload, Metrics,
};
use crate::Result;

/// Failure injected by the simulator
#[derive(Debug, thiserror::Error)]
#[error("simulated failure of call {0}")]
pub struct SimulatedFailure(pub u32);

/// One observed state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    /// Simulated time of the change
    pub at: DateTime<Utc>,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    /// Breaker name
    pub breaker: String,
    /// Calls attempted
    pub attempted: u32,
    /// Calls the breaker let through
    pub permitted: u32,
    /// Calls the breaker rejected
    pub rejected: u32,
    /// Permitted calls that failed
    pub failed: u32,
    /// Permitted calls that were slow
    pub slow: u32,
    /// State after the last call
    pub final_state: CircuitState,
    /// Statistics after the last call
    pub metrics: Metrics,
    /// State changes in order
    pub transitions: Vec<Transition>,
    /// Retained events, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<CircuitBreakerEvent>>,
}

/// Spreads `ratio` of the calls evenly over a run.
#[derive(Debug)]
struct Pattern {
    ratio: f64,
    acc: f64,
}

impl Pattern {
    fn new(ratio: f64) -> Self {
        Self { ratio, acc: 0.0 }
    }

    fn next(&mut self) -> bool {
        self.acc += self.ratio;
        if self.acc >= 1.0 {
            self.acc -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Drive the breaker named in `args` through the configured workload.
pub fn run(config: Config, args: &SimulateArgs) -> Result<SimulationReport> {
    let clock = ManualClock::at_epoch();
    let registry = CircuitBreakerRegistry::with_clock(config, Arc::new(clock.clone()))?;
    let breaker = registry.circuit_breaker(&args.name)?;

    let transitions = Arc::new(Mutex::new(Vec::new()));
    {
        let transitions = Arc::clone(&transitions);
        breaker.events().on(EventKind::StateTransition, move |event| {
            if let EventPayload::StateTransition { from, to } = event.payload {
                transitions.lock().push(Transition {
                    at: event.created_at,
                    from,
                    to,
                });
            }
        });
    }

    let interval = Duration::from_millis(args.interval_ms);
    let fast = Duration::from_millis(args.latency_ms);
    let slow = breaker.config().slow_call_duration_threshold * 2;
    let mut failures = Pattern::new(args.failure_ratio);
    let mut slowness = Pattern::new(args.slow_ratio);

    info!(
        breaker = %args.name,
        calls = args.calls,
        failure_ratio = args.failure_ratio,
        slow_ratio = args.slow_ratio,
        "Starting simulation"
    );

    let mut report = SimulationReport {
        breaker: args.name.clone(),
        attempted: 0,
        permitted: 0,
        rejected: 0,
        failed: 0,
        slow: 0,
        final_state: breaker.state(),
        metrics: breaker.metrics(),
        transitions: Vec::new(),
        events: None,
    };

    for call in 0..args.calls {
        clock.advance(interval);
        report.attempted += 1;
        // the pattern advances for rejected calls too, so the workload is independent of the breaker
        let fails = failures.next();
        let is_slow = slowness.next();
        if !breaker.try_acquire_permission() {
            report.rejected += 1;
            continue;
        }
        report.permitted += 1;

        let elapsed = if is_slow { slow } else { fast };
        clock.advance(elapsed);
        if is_slow {
            report.slow += 1;
        }
        if fails {
            report.failed += 1;
            breaker.on_error(elapsed, &SimulatedFailure(call));
        } else {
            breaker.on_success(elapsed);
        }
    }

    debug!(breaker = %args.name, now = %clock.now(), "Simulation finished");
    report.final_state = breaker.state();
    report.metrics = breaker.metrics();
    report.transitions = transitions.lock().clone();
    if args.history {
        report.events = Some(breaker.event_history());
    }
    Ok(report)
}
