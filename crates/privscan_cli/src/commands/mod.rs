//! CLI command definitions.
//!
//! This module defines the command structure for the privscan CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use privscan_runner::RuntimeFailure;

pub mod config;
pub mod scan;

/// privscan - privacy scanning of code repositories
#[derive(Parser)]
#[command(name = "privscan")]
#[command(version, about = "privscan - scan a repository for privacy issues")]
#[command(long_about = r#"
privscan runs the containerized scanning engine against a local repository.
Docker or Podman must be installed.

COMMANDS:
  scan    → Scan a repository and stream the engine's output
  config  → Print the effective settings

EXIT CODES:
  0   - Success
  1   - General error
  2   - Invalid arguments
  3   - Scan failure
  4   - Container could not be launched
  130 - Interrupted
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (defaults to $PRIVSCAN_CONFIG when set)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a codebase or repository for privacy issues
    Scan(scan::ScanArgs),

    /// Print the effective settings
    Config(config::ConfigArgs),
}

/// Command failures that map to specific exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error("Scan failed: {0}")]
    ScanFailed(RuntimeFailure),

    #[error("Scan interrupted")]
    Interrupted,
}
