//! Config command - Print the effective settings.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use privscan_runner::Settings;

#[derive(Args)]
pub struct ConfigArgs {
    /// Output format (toml, json)
    #[arg(long, default_value = "toml")]
    format: String,
}

pub async fn execute(args: ConfigArgs, config: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config).context("Failed to load settings")?;
    println!("{}", render(&settings, &args.format)?);
    Ok(())
}

fn render(settings: &Settings, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(settings).context("Failed to serialize settings"),
        "toml" => settings.to_toml().context("Failed to serialize settings"),
        other => Err(super::CliError::InvalidArguments(format!(
            "Unknown output format '{}', expected toml or json",
            other
        ))
        .into()),
    }
}
