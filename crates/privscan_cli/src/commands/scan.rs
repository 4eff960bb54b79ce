//! Scan command - Run the scanning engine against a repository.
//!
//! The engine runs in a container with the repository mounted as its source.
//! Output is streamed to the terminal; Ctrl+C stops the container gracefully.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use privscan_runner::{
    CliEngine, ContainerEngine, DockerApiEngine, EnvVar, Orchestrator, OutputEcho, RunOption,
    RunOutcome, RunStatus, Settings,
};

use super::CliError;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Repository or directory to scan
    repository: PathBuf,

    /// Rules directory merged with the default rules
    #[arg(short, long, value_name = "DIR")]
    rules: Option<PathBuf>,

    /// Ignore the default rules and only use the rules given with -r
    #[arg(short = 'i', long)]
    ignore_default_rules: bool,

    /// Skip downloading the repository's dependencies
    #[arg(long)]
    skip_dependency_download: bool,

    /// Pull the latest engine image before scanning
    #[arg(long)]
    pull: bool,

    /// Run the engine in debug mode
    #[arg(long, hide = true)]
    debug: bool,

    /// Open a browser at the URL in lines containing this phrase
    #[arg(long = "open-browser-on", value_name = "PHRASE")]
    open_browser_on: Vec<String>,

    /// Fail the scan when a line contains this phrase
    #[arg(long = "fail-on", value_name = "PHRASE")]
    fail_on: Vec<String>,

    /// Extra environment variable for the engine
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<EnvVar>,

    /// Print the container command without running it
    #[arg(long)]
    dry_run: bool,

    /// Talk to the Docker Engine API instead of the docker/podman CLI
    #[arg(long, conflicts_with = "dry_run")]
    docker_api: bool,

    /// Engine image (overrides settings)
    #[arg(long)]
    image: Option<String>,
}

pub async fn execute(args: ScanArgs, config: Option<&Path>) -> Result<()> {
    let mut settings = Settings::load(config).context("Failed to load settings")?;
    if args.dry_run {
        settings.dry_run = true;
    }
    if let Some(image) = &args.image {
        settings.image = image.clone();
    }

    let repository = absolute(&args.repository)?;
    let options = build_options(&args, &repository, &settings)?;

    println!("> Scanning directory: {}", repository.display());

    let engine: Arc<dyn ContainerEngine> = if args.docker_api {
        Arc::new(DockerApiEngine::new().await?)
    } else {
        Arc::new(CliEngine::from_settings(&settings)?)
    };
    let echo = OutputEcho::terminal(settings.ci_mode);
    let orchestrator = Orchestrator::new(engine, settings).echo_output(echo);

    let outcome = orchestrator
        .run_default(options)
        .await
        .context("Failed to run the scanning engine")?;

    report(&outcome)
}

/// Translate the command line into run options.
fn build_options(
    args: &ScanArgs,
    repository: &Path,
    settings: &Settings,
) -> Result<Vec<RunOption>, CliError> {
    if !repository.is_dir() {
        return Err(CliError::InvalidArguments(format!(
            "Could not find the directory to scan: {}",
            repository.display()
        )));
    }

    let external_rules = match &args.rules {
        Some(rules) => {
            let rules = absolute(rules).map_err(|e| CliError::InvalidArguments(e.to_string()))?;
            if !rules.exists() {
                return Err(CliError::InvalidArguments(format!(
                    "Could not validate the rules directory: {}",
                    rules.display()
                )));
            }
            rules
        }
        None => PathBuf::new(),
    };

    if args.ignore_default_rules && args.rules.is_none() {
        return Err(CliError::InvalidArguments(
            "Default rules cannot be ignored without any external rules.\n\
             You can specify your own rules using the `-r` option."
                .to_string(),
        ));
    }

    let container = &settings.container;
    // -ir is passed even when the default rules are ignored
    let mut options = vec![
        RunOption::Args(vec![
            container.source_code.clone(),
            "-ir".to_string(),
            container.internal_rules.clone(),
        ]),
        RunOption::AttachedOutput,
        RunOption::Interrupt,
        RunOption::LatestImage(args.pull),
        RunOption::SourceVolume(repository.to_path_buf()),
    ];

    let host = &settings.host;
    if let Some(path) = existing_file(&host.user_config_file) {
        options.push(RunOption::UserConfigVolume(path));
    }
    if let Some(path) = existing_file(&host.user_key_file) {
        options.push(RunOption::UserKeyVolume(path));
    }
    if let Some(path) = existing_file(&host.docker_key_file) {
        options.push(RunOption::DockerKeyVolume(path));
    }
    if let Some(dir) = &host.package_cache_dir {
        options.push(RunOption::PackageCacheVolume(dir.clone()));
    }

    options.extend([
        RunOption::IgnoreDefaultRules(args.ignore_default_rules),
        RunOption::ExternalRulesVolume(external_rules),
        RunOption::SkipDependencyDownload(args.skip_dependency_download),
        RunOption::Debug(args.debug),
    ]);

    let browser = phrases_or_default(&args.open_browser_on, &settings.triggers.browser);
    if !browser.is_empty() {
        options.push(RunOption::AutoSpawnBrowserOnUrlMessages(browser));
    }
    let fail_on = phrases_or_default(&args.fail_on, &settings.triggers.error_exit);
    if !fail_on.is_empty() {
        options.push(RunOption::ExitErrorMessages(fail_on));
    }
    if !args.env.is_empty() {
        options.push(RunOption::EnvironmentVariables(args.env.clone()));
    }

    debug!("Scan options: {:?}", options);
    Ok(options)
}

fn phrases_or_default(given: &[String], defaults: &[String]) -> Vec<String> {
    if given.is_empty() {
        defaults.to_vec()
    } else {
        given.to_vec()
    }
}

fn existing_file(path: &Option<PathBuf>) -> Option<PathBuf> {
    path.as_ref().filter(|p| p.is_file()).cloned()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path: {}", path.display()))
}

fn report(outcome: &RunOutcome) -> Result<()> {
    for warning in &outcome.warnings {
        println!("! {}", warning);
    }
    if let Some(url) = &outcome.browser_url {
        info!("Results available at {}", url);
    }

    match &outcome.status {
        RunStatus::Succeeded => {
            println!();
            println!(
                "✅ Scan completed in {:.1}s",
                outcome.duration_ms as f64 / 1000.0
            );
            Ok(())
        }
        RunStatus::Interrupted => Err(CliError::Interrupted.into()),
        RunStatus::Failed(failure) => {
            println!();
            println!("❌ Scan FAILED");
            Err(CliError::ScanFailed(failure.clone()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Commands};
    use clap::Parser;
    use privscan_runner::{EngineArg, RunConfiguration, VolumeKind};
    use tempfile::TempDir;

    fn parse(extra: &[&str], repository: &Path) -> ScanArgs {
        let mut argv = vec!["privscan".to_string(), "scan".to_string()];
        argv.push(repository.display().to_string());
        argv.extend(extra.iter().map(|s| s.to_string()));
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Scan(args) => args,
            _ => panic!("expected scan command"),
        }
    }

    /// Settings whose host files live in `dir`, with no triggers.
    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.host.user_config_file = Some(dir.path().join("config.json"));
        settings.host.user_key_file = Some(dir.path().join("user.key"));
        settings.host.docker_key_file = None;
        settings.host.package_cache_dir = Some(dir.path().join("packages"));
        settings
    }

    fn args_of(config: &RunConfiguration) -> Vec<String> {
        config
            .args
            .iter()
            .map(|arg| match arg {
                EngineArg::Literal(value) => value.clone(),
                EngineArg::VolumePath(kind) => format!("<{}>", kind),
            })
            .collect()
    }

    #[test]
    fn test_ignore_default_rules_requires_rules() {
        let dir = tempfile::tempdir().unwrap();
        let args = parse(&["-i"], dir.path());

        let err = build_options(&args, dir.path(), &settings(&dir)).unwrap_err();
        assert!(matches!(err, CliError::InvalidArguments(ref msg) if msg.contains("cannot be ignored")));
    }

    #[test]
    fn test_missing_rules_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = parse(&["-r", "/definitely/not/here"], dir.path());

        let err = build_options(&args, dir.path(), &settings(&dir)).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Could not validate the rules directory"));
    }

    #[test]
    fn test_scan_options_fold_into_engine_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules");
        std::fs::create_dir(&rules).unwrap();
        std::fs::write(dir.path().join("user.key"), "key").unwrap();

        let rules_arg = rules.display().to_string();
        let args = parse(
            &["-r", &rules_arg, "-i", "--skip-dependency-download", "--env", "TOKEN=abc"],
            dir.path(),
        );
        let options = build_options(&args, dir.path(), &settings(&dir)).unwrap();
        let config = RunConfiguration::from_options(options);

        assert_eq!(
            args_of(&config),
            vec!["/app/code", "-ir", "/app/rules", "-i", "<external rules>", "-sdd"]
        );
        assert!(config.attach_output);
        assert!(config.setup_interrupt);
        assert!(config.is_volume_enabled(VolumeKind::SourceCode));
        assert!(config.is_volume_enabled(VolumeKind::UserKey));
        assert!(!config.is_volume_enabled(VolumeKind::UserConfig), "no config file on disk");
        assert!(config.is_volume_enabled(VolumeKind::PackageCache));
        assert_eq!(
            config.volume(VolumeKind::ExternalRules).unwrap().host_path,
            rules
        );
        assert_eq!(config.environment, vec![EnvVar::new("TOKEN", "abc")]);
        assert!(config.browser_triggers.is_none());
    }

    #[test]
    fn test_triggers_fall_back_to_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir);
        settings.triggers.browser = vec!["Report ready at".to_string()];
        settings.triggers.error_exit = vec!["FATAL:".to_string()];

        let args = parse(&["--fail-on", "ERROR:"], dir.path());
        let config =
            RunConfiguration::from_options(build_options(&args, dir.path(), &settings).unwrap());

        assert_eq!(
            config.browser_triggers.unwrap().phrases,
            vec!["Report ready at"]
        );
        assert_eq!(config.error_exit_triggers.unwrap().phrases, vec!["ERROR:"]);
    }

    #[test]
    fn test_debug_flag_is_hidden_but_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let args = parse(&["--debug"], dir.path());
        let config =
            RunConfiguration::from_options(build_options(&args, dir.path(), &settings(&dir)).unwrap());
        assert_eq!(args_of(&config).last().map(String::as_str), Some("--debug"));
    }
}
