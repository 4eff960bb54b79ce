//! Example: preparing a scan and running it in dry-run mode
//!
//! Shows the invocation the orchestrator builds from a set of run options,
//! then runs it through a dry-run CLI engine, which logs the docker command
//! instead of executing it.
//!
//! Run with: cargo run --example scan_dry_run

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use privscan_runner::{
    CliEngine, CliEngineOptions, ContainerRuntime, Orchestrator, RunOption, Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("privscan_runner=info"))
        .with_target(false)
        .init();

    let settings = Settings::default();
    let engine = CliEngine::with_runtime(ContainerRuntime::Docker, CliEngineOptions::new().dry_run());
    let orchestrator = Orchestrator::new(Arc::new(engine), settings);

    let options = || {
        vec![
            RunOption::Args(vec![
                "/app/code".to_string(),
                "-ir".to_string(),
                "/app/rules".to_string(),
            ]),
            RunOption::SourceVolume(PathBuf::from(".")),
            RunOption::ExternalRulesVolume(PathBuf::from("./rules")),
            RunOption::IgnoreDefaultRules(true),
            RunOption::AttachedOutput,
            RunOption::AutoSpawnBrowserOnUrlMessages(vec!["Privacy report at".to_string()]),
            RunOption::ExitErrorMessages(vec!["FATAL:".to_string()]),
        ]
    };

    println!("=== Prepared invocation ===");
    let prepared = orchestrator.prepare(&orchestrator.settings().image, options());
    println!("{}", serde_json::to_string_pretty(&prepared.spec)?);

    println!("\n=== Dry run ===");
    let outcome = orchestrator.run_default(options()).await?;
    println!("Status: {:?}", outcome.status);

    Ok(())
}
