//! Error types for failsafe-core

use std::io;

use thiserror::Error;

use crate::failsafe::CircuitState;

/// Result type alias for failsafe-core
pub type Result<T> = std::result::Result<T, Error>;

/// failsafe-core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ring buffer created with zero capacity
    #[error("Invalid capacity: {0} (must be greater than zero)")]
    InvalidCapacity(usize),

    /// Manual transition the state machine does not allow
    #[error("Circuit breaker '{name}' cannot transition from {from} to {to}")]
    IllegalStateTransition {
        /// Breaker name
        name: String,
        /// State the breaker was in
        from: CircuitState,
        /// Requested state
        to: CircuitState,
    },

    /// Call rejected by the circuit breaker
    #[error("Circuit breaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted {
        /// Breaker name
        name: String,
        /// State that rejected the call
        state: CircuitState,
    },

    /// Ring buffer changed while an iterator was walking it
    #[error("Buffer was modified during iteration")]
    ConcurrentModification,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` when the error is a circuit-breaker rejection.
    #[must_use]
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, Self::CallNotPermitted { .. })
    }
}

/// Outcome of a call decorated by a circuit breaker.
///
/// The caller's own error is carried untouched so it can be matched on
/// after the breaker has classified it.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The breaker rejected the call; the operation never ran
    #[error(transparent)]
    Rejected(Error),

    /// The operation ran and failed
    #[error(transparent)]
    Failed(E),
}

impl<E> CallError<E> {
    /// Returns the caller's error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Rejected(_) => None,
            Self::Failed(e) => Some(e),
        }
    }

    /// Returns `true` when the breaker rejected the call.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}
