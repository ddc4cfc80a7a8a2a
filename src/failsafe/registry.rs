//! Named circuit breakers shared by handle

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::{CircuitBreaker, CircuitState, Metrics};
use crate::Result;
use crate::clock::{self, Clock};
use crate::config::{CircuitBreakerConfig, Config};

/// Point-in-time status of one registered breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSummary {
    /// Current state
    pub state: CircuitState,
    /// Current statistics
    pub metrics: Metrics,
}

/// Circuit breaker registry - creates breakers on first use
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Create a registry on the system clock.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    /// Create a registry whose breakers all use `clock`.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            breakers: DashMap::new(),
            config,
            clock,
        })
    }

    /// Get the breaker called `name`, creating it from the instance entry
    /// or the defaults.
    pub fn circuit_breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>> {
        let config = self.config.for_instance(name).clone();
        self.circuit_breaker_with_config(name, config)
    }

    /// Get the breaker called `name`, creating it from `config` if absent.
    ///
    /// An existing breaker keeps its original configuration.
    pub fn circuit_breaker_with_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.find(name) {
            return Ok(breaker);
        }
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_try_insert_with(|| {
                debug!(breaker = %name, "Registering circuit breaker");
                CircuitBreaker::builder(name)
                    .config(config)
                    .clock(Arc::clone(&self.clock))
                    .build()
                    .map(Arc::new)
            })?;
        Ok(Arc::clone(&*entry))
    }

    /// Get a registered breaker by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&*b))
    }

    /// Unregister a breaker; existing handles keep working.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    /// Names of all registered breakers, sorted
    #[must_use]
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// All registered breakers
    #[must_use]
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|b| Arc::clone(&*b)).collect()
    }

    /// State and statistics of every registered breaker, keyed by name
    #[must_use]
    pub fn summaries(&self) -> BTreeMap<String, BreakerSummary> {
        self.breakers
            .iter()
            .map(|b| {
                let summary = BreakerSummary {
                    state: b.state(),
                    metrics: b.metrics(),
                };
                (b.key().clone(), summary)
            })
            .collect()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.all_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> CircuitBreakerRegistry {
        let mut config = Config::default();
        config.instances.insert(
            "payments".to_string(),
            CircuitBreakerConfig {
                minimum_number_of_calls: 2,
                sliding_window_size: 2,
                ..CircuitBreakerConfig::default()
            },
        );
        CircuitBreakerRegistry::with_clock(config, Arc::new(ManualClock::at_epoch())).unwrap()
    }

    #[test]
    fn same_name_returns_same_breaker() {
        let registry = registry();
        let a = registry.circuit_breaker("search").unwrap();
        let b = registry.circuit_breaker("search").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all_names(), vec!["search".to_string()]);
    }

    #[test]
    fn instance_config_overrides_defaults() {
        let registry = registry();
        let payments = registry.circuit_breaker("payments").unwrap();
        let search = registry.circuit_breaker("search").unwrap();
        assert_eq!(payments.config().minimum_number_of_calls, 2);
        assert_eq!(search.config().minimum_number_of_calls, 100);
    }

    #[test]
    fn breakers_are_independent() {
        let registry = registry();
        let payments = registry.circuit_breaker("payments").unwrap();
        let search = registry.circuit_breaker("search").unwrap();
        payments.on_error(Duration::ZERO, &std::io::Error::other("down"));
        payments.on_error(Duration::ZERO, &std::io::Error::other("down"));

        let summaries = registry.summaries();
        assert_eq!(summaries["payments"].state, CircuitState::Open);
        assert_eq!(summaries["search"].state, CircuitState::Closed);
        assert_eq!(search.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn removed_breaker_is_recreated_fresh() {
        let registry = registry();
        let first = registry.circuit_breaker("search").unwrap();
        first.transition_to_forced_open_state();

        assert!(registry.remove("search").is_some());
        assert!(registry.find("search").is_none());
        let second = registry.circuit_breaker("search").unwrap();
        assert_eq!(second.state(), CircuitState::Closed);
        assert_eq!(first.state(), CircuitState::ForcedOpen);
    }

    #[test]
    fn invalid_explicit_config_is_not_registered() {
        let registry = registry();
        let result = registry.circuit_breaker_with_config(
            "broken",
            CircuitBreakerConfig {
                failure_rate_threshold: 120.0,
                ..CircuitBreakerConfig::default()
            },
        );
        assert!(result.is_err());
        assert!(registry.find("broken").is_none());
        assert!(registry.all().is_empty());
    }
}
