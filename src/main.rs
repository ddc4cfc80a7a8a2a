//! failsafe-sim - exercise a circuit breaker against a synthetic workload

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use failsafe_core::{
    cli::{Cli, Command, SimulateArgs},
    config::Config,
    setup_tracing, simulation,
};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let loaded = Config::load(cli.config.as_deref());

    // Command-line flags win over the config file
    let (level, format) = match &loaded {
        Ok(config) => (
            cli.log_level.as_deref().unwrap_or(&config.log.level),
            cli.log_format.as_deref().or(config.log.format.as_deref()),
        ),
        Err(_) => (cli.log_level.as_deref().unwrap_or("info"), cli.log_format.as_deref()),
    };

    // Setup tracing
    if let Err(e) = setup_tracing(level, format) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Simulate(args) => run_simulate(config, &args),
        Command::CheckConfig => run_check_config(&config),
    }
}

/// Run a simulation and print its report as JSON
fn run_simulate(config: Config, args: &SimulateArgs) -> ExitCode {
    let report = match simulation::run(config, args) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("❌ Simulation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        breaker = %report.breaker,
        state = %report.final_state,
        rejected = report.rejected,
        transitions = report.transitions.len(),
        "Simulation complete"
    );
    print_json(&report)
}

/// Print the validated configuration
fn run_check_config(config: &Config) -> ExitCode {
    info!(instances = config.instances.len(), "Configuration is valid");
    print_json(config)
}

fn print_json(value: &impl serde::Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize to JSON: {e}");
            ExitCode::FAILURE
        }
    }
}
