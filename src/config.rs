//! Configuration management

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::window::SlidingWindowType;
use crate::{Error, Result};

/// Environment variable prefix; `__` separates nested keys.
pub const ENV_PREFIX: &str = "FAILSAFE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Circuit breaker settings used for names without an instance entry
    pub defaults: CircuitBreakerConfig,
    /// Per-breaker settings, keyed by breaker name.
    /// An entry replaces the defaults as a whole.
    pub instances: HashMap<String, CircuitBreakerConfig>,
}

impl Config {
    /// Load configuration from an optional YAML file and `FAILSAFE_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the defaults and every instance entry.
    pub fn validate(&self) -> Result<()> {
        self.defaults
            .validate()
            .map_err(|e| Error::Config(format!("defaults: {e}")))?;
        for (name, instance) in &self.instances {
            instance
                .validate()
                .map_err(|e| Error::Config(format!("instance '{name}': {e}")))?;
        }
        Ok(())
    }

    /// Settings for the breaker called `name`.
    #[must_use]
    pub fn for_instance(&self, name: &str) -> &CircuitBreakerConfig {
        self.instances.get(name).unwrap_or(&self.defaults)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, json)
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent) at or above which the breaker opens
    pub failure_rate_threshold: f32,
    /// Slow-call rate (percent) at or above which the breaker opens
    pub slow_call_rate_threshold: f32,
    /// Calls taking longer than this count as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,
    /// Calls needed in the window before rates are evaluated
    pub minimum_number_of_calls: u32,
    /// Probe calls allowed while half-open
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Time to stay open before probing
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open_state: Duration,
    /// Longest time to stay half-open without a verdict; zero waits forever
    #[serde(with = "humantime_serde")]
    pub max_wait_duration_in_half_open_state: Duration,
    /// Calls (count-based) or seconds (time-based) in the sliding window
    pub sliding_window_size: u32,
    /// Kind of sliding window
    pub sliding_window_type: SlidingWindowType,
    /// Events retained for inspection
    pub event_history_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            minimum_number_of_calls: 100,
            permitted_number_of_calls_in_half_open_state: 10,
            wait_duration_in_open_state: Duration::from_secs(60),
            max_wait_duration_in_half_open_state: Duration::ZERO,
            sliding_window_size: 100,
            sliding_window_type: SlidingWindowType::CountBased,
            event_history_size: 100,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reject settings the breaker cannot run with.
    pub fn validate(&self) -> Result<()> {
        check_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        check_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        if self.sliding_window_size == 0 {
            return Err(Error::Config(
                "sliding_window_size must be at least 1".to_string(),
            ));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(Error::Config(
                "minimum_number_of_calls must be at least 1".to_string(),
            ));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(Error::Config(
                "permitted_number_of_calls_in_half_open_state must be at least 1".to_string(),
            ));
        }
        if self.wait_duration_in_open_state < Duration::from_millis(1) {
            return Err(Error::Config(
                "wait_duration_in_open_state must be at least 1ms".to_string(),
            ));
        }
        if self.slow_call_duration_threshold.is_zero() {
            return Err(Error::Config(
                "slow_call_duration_threshold must be greater than zero".to_string(),
            ));
        }
        if self.event_history_size == 0 {
            return Err(Error::Config(
                "event_history_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Minimum calls actually required before rates are evaluated.
    ///
    /// A count-based window can never hold more than its size, so the
    /// minimum is capped there.
    #[must_use]
    pub fn effective_minimum_number_of_calls(&self) -> u32 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                self.minimum_number_of_calls.min(self.sliding_window_size)
            }
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }
}

fn check_rate(field: &str, value: f32) -> Result<()> {
    if value.is_nan() || value <= 0.0 || value > 100.0 {
        return Err(Error::Config(format!(
            "{field} must be in (0, 100], got {value}"
        )));
    }
    Ok(())
}
