//! # privscan_runner
//!
//! Container run orchestrator for the privscan scanning engine.
//!
//! This crate turns a list of run options into one container invocation,
//! launches it through Docker or Podman, and supervises it until it exits:
//! attached output is scanned for trigger phrases while host interrupts are
//! forwarded to the container as a graceful stop.
//!
//! # Features
//!
//! - **Run Options**: Independent options folded into one [`RunConfiguration`]
//! - **Multiple Engines**: Docker API (bollard), CLI wrapper (docker/podman)
//! - **Runtime Detection**: Auto-detect Docker vs Podman
//! - **Dry-Run Mode**: Log commands without execution
//! - **Output Triggers**: Open a browser or fail the run on matching lines
//! - **Scoped Interrupts**: Graceful stop, then kill, for exactly one run
//! - **Mock Engine**: For testing without actual containers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use privscan_runner::{CliEngine, Orchestrator, RunOption, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(None)?;
//!     let engine = CliEngine::from_settings(&settings)?;
//!     let orchestrator = Orchestrator::new(Arc::new(engine), settings);
//!
//!     let outcome = orchestrator
//!         .run_default(vec![
//!             RunOption::Args(vec!["/app/code".into(), "-ir".into(), "/app/rules".into()]),
//!             RunOption::SourceVolume(PathBuf::from(".")),
//!             RunOption::AttachedOutput,
//!             RunOption::Interrupt,
//!             RunOption::ExitErrorMessages(vec!["FATAL:".into()]),
//!         ])
//!         .await?;
//!     println!("Exit code: {:?}", outcome.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod command;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod mock;
pub mod options;
pub mod orchestrator;
pub mod outcome;
pub mod supervisor;
pub mod triggers;
pub mod volumes;

pub use cli::{CliEngine, CliEngineOptions, ContainerRuntime};
pub use command::{CommandBuilder, ProcessSpec, SupervisionPlan};
pub use config::{ContainerPaths, HostPaths, Settings, TriggerDefaults};
pub use docker::DockerApiEngine;
pub use engine::{
    ContainerControl, ContainerEngine, LogLine, LogStream, SpawnOptions, SpawnedContainer,
};
pub use error::{LaunchError, RunnerError, RunnerResult};
pub use interrupt::{InterruptGuard, InterruptSource, InterruptTrigger};
pub use mock::{CapturedCall, MockBehavior, MockEngine, MockResponse, RecordingBrowser};
pub use options::{
    ConfigurationWarning, EngineArg, EnvVar, RunConfiguration, RunOption, TriggerAction,
    TriggerSet,
};
pub use orchestrator::{Orchestrator, PreparedRun};
pub use outcome::{RunOutcome, RunStatus, RuntimeFailure};
pub use supervisor::{OutputEcho, ProcessSupervisor};
pub use triggers::{BrowserLauncher, OutputTriggerMatcher, SystemBrowser, TriggerEvent};
pub use volumes::{MountArg, VolumeKind, VolumeResolver, VolumeSpec};
