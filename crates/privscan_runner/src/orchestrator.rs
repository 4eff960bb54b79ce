//! Entry point for running the scanning engine once.

use std::sync::Arc;

use tracing::{debug, info};

use crate::command::{CommandBuilder, ProcessSpec, SupervisionPlan};
use crate::config::Settings;
use crate::engine::{ContainerEngine, SpawnOptions};
use crate::error::{LaunchError, RunnerError, RunnerResult};
use crate::interrupt::InterruptSource;
use crate::options::{RunConfiguration, RunOption};
use crate::outcome::RunOutcome;
use crate::supervisor::{OutputEcho, ProcessSupervisor};
use crate::triggers::{BrowserLauncher, SystemBrowser};

/// A run with every option applied, ready to launch.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub config: RunConfiguration,
    pub spec: ProcessSpec,
    pub plan: SupervisionPlan,
}

/// Configures, launches and supervises scanning engine containers.
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    settings: Settings,
    builder: CommandBuilder,
    browser: Arc<dyn BrowserLauncher>,
    interrupts: InterruptSource,
    echo: OutputEcho,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: Settings) -> Self {
        let builder = CommandBuilder::new(settings.container.clone());
        Self {
            engine,
            settings,
            builder,
            browser: Arc::new(SystemBrowser),
            interrupts: InterruptSource::default(),
            echo: OutputEcho::silent(),
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_interrupt_source(mut self, source: InterruptSource) -> Self {
        self.interrupts = source;
        self
    }

    /// Echo attached output to the terminal.
    pub fn echo_output(mut self, echo: OutputEcho) -> Self {
        self.echo = echo;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn engine_name(&self) -> String {
        self.engine.name()
    }

    /// Fold the options and build the invocation without launching anything.
    pub fn prepare<I>(&self, image: &str, options: I) -> PreparedRun
    where
        I: IntoIterator<Item = RunOption>,
    {
        let config = RunConfiguration::from_options(options);
        let spec = self.builder.build(image, &config);
        let plan = SupervisionPlan::from_config(&config, self.settings.stop_grace_period());
        PreparedRun { config, spec, plan }
    }

    /// Run `image` once with the given options.
    ///
    /// Failures before the container starts are [`RunnerError::Launch`];
    /// everything after is reported in the returned outcome.
    pub async fn run<I>(&self, image: &str, options: I) -> RunnerResult<RunOutcome>
    where
        I: IntoIterator<Item = RunOption>,
    {
        let PreparedRun { config, spec, plan } = self.prepare(image, options);
        debug!("Prepared run: {:?}", spec);

        let version = self
            .engine
            .version()
            .await
            .map_err(|e| launch_error(e, LaunchError::RuntimeUnavailable))?;
        info!("Using {}", version);

        self.ensure_image(&spec).await?;

        // Installed right before the spawn and released when supervision
        // returns, so the listener covers exactly this run.
        let guard = plan.interrupt_enabled.then(|| self.interrupts.install());

        info!("Starting {} with {}", spec.image, self.engine.name());
        let container = self
            .engine
            .spawn(&spec, SpawnOptions::from_plan(&plan))
            .await
            .map_err(|e| launch_error(e, LaunchError::SpawnFailed))?;

        let supervisor = ProcessSupervisor::new(self.browser.clone()).with_echo(self.echo);
        let mut outcome = supervisor.supervise(container, &plan, guard).await?;
        outcome.warnings = config.warnings;
        Ok(outcome)
    }

    /// Run the configured default image.
    pub async fn run_default<I>(&self, options: I) -> RunnerResult<RunOutcome>
    where
        I: IntoIterator<Item = RunOption>,
    {
        let image = self.settings.image.clone();
        self.run(&image, options).await
    }

    async fn ensure_image(&self, spec: &ProcessSpec) -> RunnerResult<()> {
        if spec.pull_latest_image {
            return self
                .engine
                .pull_image(&spec.image)
                .await
                .map_err(|e| launch_error(e, LaunchError::ImagePullFailed));
        }

        let exists = self
            .engine
            .image_exists(&spec.image)
            .await
            .map_err(|e| launch_error(e, LaunchError::RuntimeUnavailable))?;
        if !exists {
            return Err(LaunchError::ImageNotFound(spec.image.clone()).into());
        }
        Ok(())
    }
}

/// Classify a pre-start failure as a launch error.
fn launch_error(err: RunnerError, wrap: fn(String) -> LaunchError) -> RunnerError {
    match err {
        RunnerError::Launch(_) => err,
        other => wrap(other.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use crate::volumes::VolumeKind;
    use std::path::PathBuf;

    fn orchestrator(engine: MockEngine) -> Orchestrator {
        Orchestrator::new(Arc::new(engine), Settings::default())
    }

    #[test]
    fn test_prepare_builds_spec_and_plan() {
        let orchestrator = orchestrator(MockEngine::new());
        let prepared = orchestrator.prepare(
            "scan-engine:test",
            vec![
                RunOption::Args(vec![
                    "/app/code".to_string(),
                    "-ir".to_string(),
                    "/app/rules".to_string(),
                ]),
                RunOption::SourceVolume(PathBuf::from("/work/repo")),
                RunOption::Interrupt,
                RunOption::Debug(true),
            ],
        );

        assert!(prepared.config.is_volume_enabled(VolumeKind::SourceCode));
        assert_eq!(
            prepared.spec.args,
            vec!["/app/code", "-ir", "/app/rules", "--debug"]
        );
        assert!(prepared.plan.attach_output);
        assert!(prepared.plan.interrupt_enabled);
        assert_eq!(
            prepared.plan.stop_grace_period,
            Settings::default().stop_grace_period()
        );
    }

    #[test]
    fn test_launch_error_classification() {
        let wrapped = launch_error(
            RunnerError::Supervision("socket closed".to_string()),
            LaunchError::SpawnFailed,
        );
        assert!(matches!(
            wrapped,
            RunnerError::Launch(LaunchError::SpawnFailed(_))
        ));

        let kept = launch_error(
            LaunchError::PermissionDenied("docker.sock".to_string()).into(),
            LaunchError::SpawnFailed,
        );
        assert!(matches!(
            kept,
            RunnerError::Launch(LaunchError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_image_is_launch_error() {
        let engine = MockEngine::new();
        let result = orchestrator(engine.clone())
            .run("scan-engine:missing", vec![RunOption::AttachedOutput])
            .await;

        assert!(matches!(
            result,
            Err(RunnerError::Launch(LaunchError::ImageNotFound(_)))
        ));
        assert!(!engine.was_called("spawn"));
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_launch_error() {
        let engine = MockEngine::new()
            .set_available(false)
            .add_existing_image("scan-engine:test");
        let result = orchestrator(engine.clone())
            .run("scan-engine:test", vec![RunOption::AttachedOutput])
            .await;

        assert!(matches!(
            result,
            Err(RunnerError::Launch(LaunchError::RuntimeUnavailable(_)))
        ));
        assert!(!engine.was_called("image_exists"));
        assert!(!engine.was_called("spawn"));
    }

    #[tokio::test]
    async fn test_spawn_options_follow_interrupt_handling() {
        let engine = MockEngine::new().add_existing_image("scan-engine:test");
        let orchestrator = orchestrator(engine.clone());

        orchestrator
            .run("scan-engine:test", vec![RunOption::AttachedOutput])
            .await
            .unwrap();
        orchestrator
            .run("scan-engine:test", vec![RunOption::Interrupt])
            .await
            .unwrap();

        let options: Vec<_> = engine
            .get_method_calls("spawn")
            .into_iter()
            .filter_map(|call| call.options)
            .collect();
        assert_eq!(
            options,
            vec![
                SpawnOptions {
                    attach: true,
                    owns_interrupts: false,
                },
                SpawnOptions {
                    attach: false,
                    owns_interrupts: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_pull_replaces_existence_check() {
        let engine = MockEngine::new();
        let outcome = orchestrator(engine.clone())
            .run("scan-engine:next", vec![RunOption::LatestImage(true)])
            .await
            .unwrap();

        assert!(outcome.success());
        assert!(engine.was_called("pull_image"));
        assert!(!engine.was_called("image_exists"));
    }
}
