//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Circuit breaker simulator - drive a breaker with a synthetic workload
#[derive(Parser, Debug)]
#[command(name = "failsafe-sim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FAILSAFE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "FAILSAFE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json); overrides the config file
    #[arg(long, env = "FAILSAFE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a deterministic workload through one breaker on a simulated clock
    Simulate(SimulateArgs),

    /// Load and validate the configuration, then print it
    CheckConfig,
}

/// Workload shape for `simulate`
#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Breaker name; selects the instance entry from the configuration
    #[arg(short, long, default_value = "simulated")]
    pub name: String,

    /// Number of calls to attempt
    #[arg(long, default_value_t = 200)]
    pub calls: u32,

    /// Fraction of calls that fail (0.0 to 1.0)
    #[arg(long, default_value_t = 0.5, value_parser = parse_ratio)]
    pub failure_ratio: f64,

    /// Fraction of calls that are slow (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0, value_parser = parse_ratio)]
    pub slow_ratio: f64,

    /// Simulated time between calls, in milliseconds
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// Simulated duration of a fast call, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub latency_ms: u64,

    /// Include the retained event history in the report
    #[arg(long)]
    pub history: bool,
}

fn parse_ratio(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not between 0.0 and 1.0"))
    }
}
