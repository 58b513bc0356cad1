//! Command-line entry point for the backend harness.
//!
//! Boots the configured worker, prints the relay address on stdout and keeps
//! the backend alive until a termination signal arrives.

use std::io::{self, Write};
use std::process::ExitCode;

use backend_harness::{BootstrapPlan, SystemShutdownSignal, initialise_telemetry, serve};
use harness_config::HarnessConfig;
use ortho_config::OrthoConfig;

fn main() -> ExitCode {
    let config = match HarnessConfig::load() {
        Ok(config) => config,
        Err(error) => return fail(&format!("failed to load configuration: {error}")),
    };
    if let Err(error) = initialise_telemetry(&config) {
        return fail(&error.to_string());
    }
    let mut stdout = io::stdout().lock();
    match serve(
        BootstrapPlan::from_config(&config),
        &SystemShutdownSignal,
        &mut stdout,
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => fail(&error.to_string()),
    }
}

fn fail(message: &str) -> ExitCode {
    // Nothing useful remains to be done if stderr itself is gone.
    let _ = writeln!(io::stderr().lock(), "backend-harness: {message}");
    ExitCode::FAILURE
}
