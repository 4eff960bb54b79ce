//! privscan CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Scan failure
//! - 4: Launch error
//! - 130: Interrupted

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use privscan_runner::RunnerError;

mod commands;

use commands::{Cli, CliError, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const SCAN_FAILURE: u8 = 3;
    pub const LAUNCH_ERROR: u8 = 4;
    pub const INTERRUPTED: u8 = 130;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "privscan=debug"
    } else if cli.quiet {
        "privscan=warn"
    } else {
        "privscan=info"
    };

    // Initialize logging
    let log_result = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::from_default_env()
                .add_directive(level.parse().unwrap())
                .add_directive("warn".parse().unwrap()),
        )
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Scan(args) => commands::scan::execute(args, config).await,
        Commands::Config(args) => commands::config::execute(args, config).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            if exit_code == ExitCodes::INTERRUPTED {
                eprintln!("Scan interrupted");
            } else {
                eprintln!("❌ Error: {:#}", e);
            }
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<CliError>() {
        return match err {
            CliError::InvalidArguments(_) => ExitCodes::INVALID_ARGS,
            CliError::ScanFailed(_) => ExitCodes::SCAN_FAILURE,
            CliError::Interrupted => ExitCodes::INTERRUPTED,
        };
    }

    match e.downcast_ref::<RunnerError>() {
        Some(RunnerError::Launch(_)) => ExitCodes::LAUNCH_ERROR,
        Some(RunnerError::Settings(_)) | Some(RunnerError::Toml(_)) => ExitCodes::INVALID_ARGS,
        _ => ExitCodes::GENERAL_ERROR,
    }
}
