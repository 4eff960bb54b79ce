//! Mock container engine for testing.
//!
//! Provides a scripted implementation of the ContainerEngine trait so the
//! orchestrator and supervisor can be tested without Docker or Podman. Each
//! spawned container replays its response's lines and then behaves as told:
//! exit on its own, wait to be stopped, or ignore stop requests entirely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};

use crate::command::ProcessSpec;
use crate::engine::{
    generate_container_name, ContainerControl, ContainerEngine, LogLine, SpawnOptions,
    SpawnedContainer, OUTPUT_CHANNEL_CAPACITY,
};
use crate::error::{LaunchError, RunnerError, RunnerResult};
use crate::triggers::BrowserLauncher;

/// Exit code a mock container reports after a graceful stop.
pub const MOCK_STOPPED_EXIT_CODE: i64 = 143;

/// Exit code a mock container reports after a kill.
pub const MOCK_KILLED_EXIT_CODE: i64 = 137;

/// What a mock container does once its output is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Exit with the response's exit code
    Exit,
    /// Keep running until stopped or killed
    RunUntilStopped,
    /// Keep running through stop requests; only a kill ends it
    IgnoreStop,
}

/// Predefined script for one spawned container.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub lines: Vec<LogLine>,
    pub exit_code: i64,
    pub behavior: MockBehavior,
    /// Pause before each line
    pub line_delay: Duration,
}

impl MockResponse {
    pub fn success() -> Self {
        Self {
            lines: Vec::new(),
            exit_code: 0,
            behavior: MockBehavior::Exit,
            line_delay: Duration::ZERO,
        }
    }

    pub fn failure(exit_code: i64) -> Self {
        Self {
            exit_code,
            ..Self::success()
        }
    }

    pub fn stdout(mut self, message: impl Into<String>) -> Self {
        self.lines.push(LogLine::stdout(message));
        self
    }

    pub fn stderr(mut self, message: impl Into<String>) -> Self {
        self.lines.push(LogLine::stderr(message));
        self
    }

    pub fn until_stopped(mut self) -> Self {
        self.behavior = MockBehavior::RunUntilStopped;
        self
    }

    pub fn ignoring_stop(mut self) -> Self {
        self.behavior = MockBehavior::IgnoreStop;
        self
    }

    pub fn with_line_delay(mut self, ms: u64) -> Self {
        self.line_delay = Duration::from_millis(ms);
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub image: Option<String>,
    pub container: Option<String>,
    pub spec: Option<ProcessSpec>,
    pub options: Option<SpawnOptions>,
}

impl CapturedCall {
    fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            image: None,
            container: None,
            spec: None,
            options: None,
        }
    }
}

/// Mock container engine for testing.
///
/// Captures every call and replays predefined responses, cycling through
/// them when more containers are spawned than responses were added.
#[derive(Clone)]
pub struct MockEngine {
    /// Whether the engine should report as available.
    available: Arc<RwLock<bool>>,
    /// Version string to return.
    version: Arc<RwLock<String>>,
    /// Predefined responses for spawn calls.
    responses: Arc<RwLock<Vec<MockResponse>>>,
    /// Index of next response to return.
    response_index: Arc<AtomicUsize>,
    /// Captured calls for verification.
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// Images that "exist".
    existing_images: Arc<RwLock<Vec<String>>>,
    /// Launch failure returned by pull and spawn.
    launch_failure: Arc<RwLock<Option<LaunchError>>>,
    /// Names of containers that have not exited yet.
    running: Arc<RwLock<HashSet<String>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create a new mock engine.
    pub fn new() -> Self {
        Self {
            available: Arc::new(RwLock::new(true)),
            version: Arc::new(RwLock::new("mock-engine 1.0.0".to_string())),
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            existing_images: Arc::new(RwLock::new(Vec::new())),
            launch_failure: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Set whether the engine is available.
    pub fn set_available(self, available: bool) -> Self {
        *self.available.write() = available;
        self
    }

    /// Set the version string.
    pub fn set_version(self, version: impl Into<String>) -> Self {
        *self.version.write() = version.into();
        self
    }

    /// Add a response for the next spawned container.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Add an image that should "exist".
    pub fn add_existing_image(self, image: impl Into<String>) -> Self {
        self.existing_images.write().push(image.into());
        self
    }

    /// Make pulls and spawns fail with `error`.
    pub fn simulate_launch_failure(self, error: LaunchError) -> Self {
        *self.launch_failure.write() = Some(error);
        self
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Check if a specific method was called.
    pub fn was_called(&self, method: &str) -> bool {
        self.captured_calls
            .read()
            .iter()
            .any(|c| c.method == method)
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Containers that have been spawned and not yet exited.
    pub fn running_containers(&self) -> Vec<String> {
        self.running.read().iter().cloned().collect()
    }

    pub fn stop_requests(&self) -> usize {
        self.get_method_calls("stop").len()
    }

    pub fn kill_requests(&self) -> usize {
        self.get_method_calls("kill").len()
    }

    fn record_call(&self, call: CapturedCall) {
        self.captured_calls.write().push(call);
    }

    fn next_response(&self) -> MockResponse {
        let responses = self.responses.read();
        if responses.is_empty() {
            return MockResponse::success();
        }
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index % responses.len())
            .cloned()
            .unwrap_or_else(MockResponse::success)
    }

    fn check_failure(&self) -> RunnerResult<()> {
        match self.launch_failure.read().clone() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn version(&self) -> RunnerResult<String> {
        self.record_call(CapturedCall::new("version"));
        if !*self.available.read() {
            return Err(LaunchError::RuntimeUnavailable(
                "mock engine is not available".to_string(),
            )
            .into());
        }
        Ok(self.version.read().clone())
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        self.record_call(CapturedCall {
            image: Some(image.to_string()),
            ..CapturedCall::new("image_exists")
        });
        Ok(self.existing_images.read().iter().any(|i| i == image))
    }

    async fn pull_image(&self, image: &str) -> RunnerResult<()> {
        self.record_call(CapturedCall {
            image: Some(image.to_string()),
            ..CapturedCall::new("pull_image")
        });
        self.check_failure()?;
        self.existing_images.write().push(image.to_string());
        Ok(())
    }

    async fn spawn(
        &self,
        spec: &ProcessSpec,
        options: SpawnOptions,
    ) -> RunnerResult<SpawnedContainer> {
        let name = generate_container_name(&spec.name_prefix);
        self.record_call(CapturedCall {
            image: Some(spec.image.clone()),
            container: Some(name.clone()),
            spec: Some(spec.clone()),
            options: Some(options),
            ..CapturedCall::new("spawn")
        });
        self.check_failure()?;

        let response = self.next_response();
        let (tx, rx) = if options.attach {
            let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let control = Arc::new(MockControl {
            name: name.clone(),
            calls: self.captured_calls.clone(),
            stop: Arc::new(Notify::new()),
            kill: Arc::new(Notify::new()),
        });

        self.running.write().insert(name.clone());
        let running = self.running.clone();
        let task_name = name.clone();
        let stop = control.stop.clone();
        let kill = control.kill.clone();
        let handle = tokio::spawn(async move {
            let exit_code = run_container(response, tx, stop, kill).await;
            running.write().remove(&task_name);
            exit_code
        });

        Ok(SpawnedContainer {
            name,
            control,
            output: rx,
            exit: Box::pin(async move {
                handle
                    .await
                    .map_err(|e| RunnerError::Supervision(format!("mock container task failed: {}", e)))
            }),
        })
    }
}

async fn run_container(
    response: MockResponse,
    output: Option<mpsc::Sender<LogLine>>,
    stop: Arc<Notify>,
    kill: Arc<Notify>,
) -> i64 {
    for line in response.lines {
        if !response.line_delay.is_zero() {
            tokio::time::sleep(response.line_delay).await;
        }
        if let Some(tx) = &output {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    }

    // Output stays open until the container is gone.
    let exit_code = match response.behavior {
        MockBehavior::Exit => response.exit_code,
        MockBehavior::RunUntilStopped => tokio::select! {
            _ = stop.notified() => MOCK_STOPPED_EXIT_CODE,
            _ = kill.notified() => MOCK_KILLED_EXIT_CODE,
        },
        MockBehavior::IgnoreStop => {
            kill.notified().await;
            MOCK_KILLED_EXIT_CODE
        }
    };
    drop(output);
    exit_code
}

struct MockControl {
    name: String,
    calls: Arc<RwLock<Vec<CapturedCall>>>,
    stop: Arc<Notify>,
    kill: Arc<Notify>,
}

#[async_trait]
impl ContainerControl for MockControl {
    async fn stop(&self, _grace: Duration) -> RunnerResult<()> {
        self.calls.write().push(CapturedCall {
            container: Some(self.name.clone()),
            ..CapturedCall::new("stop")
        });
        self.stop.notify_one();
        Ok(())
    }

    async fn kill(&self) -> RunnerResult<()> {
        self.calls.write().push(CapturedCall {
            container: Some(self.name.clone()),
            ..CapturedCall::new("kill")
        });
        self.kill.notify_one();
        Ok(())
    }
}

/// Browser launcher that records URLs instead of opening them.
#[derive(Debug, Default)]
pub struct RecordingBrowser {
    opened: RwLock<Vec<String>>,
    fail: bool,
}

impl RecordingBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record URLs but report every open as failed.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.read().clone()
    }
}

impl BrowserLauncher for RecordingBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.opened.write().push(url.to_string());
        if self.fail {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no browser available",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ProcessSpec {
        ProcessSpec {
            image: "scan-engine:test".to_string(),
            pull_latest_image: false,
            name_prefix: "privscan".to_string(),
            mounts: Vec::new(),
            env: Vec::new(),
            args: vec!["/app/code".to_string()],
        }
    }

    fn attached() -> SpawnOptions {
        SpawnOptions {
            attach: true,
            owns_interrupts: false,
        }
    }

    #[tokio::test]
    async fn test_mock_engine_availability() {
        let engine = MockEngine::new().set_version("mock 2.0");
        assert_eq!(engine.version().await.unwrap(), "mock 2.0");

        let engine = MockEngine::new().set_available(false);
        assert!(matches!(
            engine.version().await,
            Err(RunnerError::Launch(LaunchError::RuntimeUnavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_mock_engine_replays_output() {
        let engine = MockEngine::new()
            .add_response(MockResponse::failure(3).stdout("one").stderr("two"));

        let mut container = engine.spawn(&spec(), attached()).await.unwrap();
        let mut output = container.output.take().unwrap();

        assert_eq!(output.recv().await.unwrap().message, "one");
        assert_eq!(output.recv().await.unwrap().message, "two");
        assert!(output.recv().await.is_none());
        assert_eq!(container.exit.await.unwrap(), 3);
        assert!(engine.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_mock_engine_captures_spawn() {
        let engine = MockEngine::new();
        let container = engine.spawn(&spec(), SpawnOptions::default()).await.unwrap();
        assert!(container.output.is_none());
        container.exit.await.unwrap();

        let calls = engine.get_method_calls("spawn");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].image.as_deref(), Some("scan-engine:test"));
        assert_eq!(calls[0].options, Some(SpawnOptions::default()));
        assert_eq!(calls[0].spec.as_ref().unwrap().args, vec!["/app/code"]);
    }

    #[tokio::test]
    async fn test_mock_container_stop_and_kill() {
        let engine = MockEngine::new()
            .add_response(MockResponse::success().until_stopped())
            .add_response(MockResponse::success().ignoring_stop());

        let stoppable = engine.spawn(&spec(), SpawnOptions::default()).await.unwrap();
        assert_eq!(engine.running_containers().len(), 1);
        stoppable.control.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stoppable.exit.await.unwrap(), MOCK_STOPPED_EXIT_CODE);

        let stubborn = engine.spawn(&spec(), SpawnOptions::default()).await.unwrap();
        stubborn.control.stop(Duration::from_secs(1)).await.unwrap();
        stubborn.control.kill().await.unwrap();
        assert_eq!(stubborn.exit.await.unwrap(), MOCK_KILLED_EXIT_CODE);

        assert_eq!(engine.stop_requests(), 2);
        assert_eq!(engine.kill_requests(), 1);
        assert!(engine.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_mock_engine_launch_failure() {
        let engine = MockEngine::new()
            .simulate_launch_failure(LaunchError::PermissionDenied("docker.sock".to_string()));

        let result = engine.spawn(&spec(), attached()).await;
        assert!(matches!(
            result,
            Err(RunnerError::Launch(LaunchError::PermissionDenied(_)))
        ));
    }

    #[tokio::test]
    async fn test_mock_engine_image_tracking() {
        let engine = MockEngine::new().add_existing_image("scan-engine:test");

        assert!(engine.image_exists("scan-engine:test").await.unwrap());
        assert!(!engine.image_exists("scan-engine:next").await.unwrap());

        engine.pull_image("scan-engine:next").await.unwrap();
        assert!(engine.image_exists("scan-engine:next").await.unwrap());
    }

    #[test]
    fn test_recording_browser() {
        let browser = RecordingBrowser::failing();
        assert!(browser.open("http://localhost:1234").is_err());
        assert_eq!(browser.opened(), vec!["http://localhost:1234"]);
    }
}
