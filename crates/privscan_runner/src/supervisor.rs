//! Supervision of one running container.
//!
//! Two activities run per container: the supervisor waits for the exit or an
//! interrupt, and a drain task reads attached output through the trigger
//! matcher. The output channel is bounded, so a slow drain delays the
//! container's readers instead of losing lines.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::SupervisionPlan;
use crate::engine::{ContainerControl, LogLine, LogStream, OutputReceiver, SpawnedContainer};
use crate::error::{RunnerError, RunnerResult};
use crate::interrupt::{next_interrupt, InterruptGuard};
use crate::outcome::{RunOutcome, RunStatus, RuntimeFailure};
use crate::triggers::{BrowserLauncher, OutputTriggerMatcher, SystemBrowser, TriggerEvent, TriggerReport};

/// Extra time allowed past the grace period before killing.
pub const STOP_MARGIN: Duration = Duration::from_secs(2);

/// How long to wait for the container to go away after a kill.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for buffered output after the container exited.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal echo of attached engine output.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputEcho {
    pub enabled: bool,
    /// Prefix each line with a timestamp and stream
    pub ci_mode: bool,
}

impl OutputEcho {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn terminal(ci_mode: bool) -> Self {
        Self {
            enabled: true,
            ci_mode,
        }
    }

    fn emit(&self, line: &LogLine) {
        if !self.enabled {
            return;
        }
        if self.ci_mode {
            println!(
                "[{}] [{}] {}",
                line.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                line.stream,
                line.message
            );
        } else {
            match line.stream {
                LogStream::Stdout => println!("{}", line.message),
                LogStream::Stderr => eprintln!("{}", line.message),
            }
        }
    }
}

/// Read output until the container closes it, firing trigger actions.
///
/// The first error-exit match is also sent through `on_error`.
pub async fn drain_output(
    mut output: OutputReceiver,
    mut matcher: OutputTriggerMatcher,
    browser: Arc<dyn BrowserLauncher>,
    echo: OutputEcho,
    mut on_error: Option<oneshot::Sender<String>>,
) -> TriggerReport {
    while let Some(line) = output.recv().await {
        echo.emit(&line);

        for event in matcher.observe(&line.message) {
            match event {
                TriggerEvent::OpenBrowser { url, .. } => {
                    info!("Opening browser at {}", url);
                    if let Err(e) = browser.open(&url) {
                        warn!("Failed to open browser at {}: {}", url, e);
                    }
                }
                TriggerEvent::FailRun { line } => {
                    error!("Scanning engine reported an error: {}", line);
                    if let Some(tx) = on_error.take() {
                        let _ = tx.send(line);
                    }
                }
            }
        }
    }

    matcher.into_report()
}

/// Waits for a container while reacting to its output and to interrupts.
pub struct ProcessSupervisor {
    browser: Arc<dyn BrowserLauncher>,
    echo: OutputEcho,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Arc::new(SystemBrowser))
    }
}

impl ProcessSupervisor {
    pub fn new(browser: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            browser,
            echo: OutputEcho::silent(),
        }
    }

    pub fn with_echo(mut self, echo: OutputEcho) -> Self {
        self.echo = echo;
        self
    }

    /// Supervise `container` until it exits.
    ///
    /// `guard` is the run's interrupt listener; it is dropped when this
    /// returns. Errors here are supervision errors, the container has
    /// already started.
    pub async fn supervise(
        &self,
        container: SpawnedContainer,
        plan: &SupervisionPlan,
        mut guard: Option<InterruptGuard>,
    ) -> RunnerResult<RunOutcome> {
        let started_at = Utc::now();
        let SpawnedContainer {
            name,
            control,
            output,
            mut exit,
        } = container;

        let (error_tx, mut error_rx) = oneshot::channel::<String>();
        let drain = match output {
            Some(output) => Some(tokio::spawn(drain_output(
                output,
                OutputTriggerMatcher::from_plan(plan),
                self.browser.clone(),
                self.echo,
                Some(error_tx),
            ))),
            None => {
                if plan.has_triggers() {
                    warn!(
                        "Output of {} is not attached; trigger phrases will not be checked",
                        name
                    );
                }
                None
            }
        };

        debug!("Supervising container {}", name);

        let mut interrupted = false;
        let mut error_armed = drain.is_some();
        let mut reported_error: Option<String> = None;
        let exit_result = loop {
            tokio::select! {
                result = &mut exit => break result,
                signal = next_interrupt(&mut guard) => match signal {
                    Some(()) => {
                        warn!("Interrupt received, stopping container {}", name);
                        interrupted = true;
                        break terminate(&name, &control, &mut exit, &mut guard, plan.stop_grace_period).await;
                    }
                    None => guard = None,
                },
                matched = &mut error_rx, if error_armed => {
                    error_armed = false;
                    if let Ok(line) = matched {
                        info!("Stopping container {} after reported error", name);
                        reported_error = Some(line);
                        let stopper = control.clone();
                        let grace = plan.stop_grace_period;
                        tokio::spawn(async move {
                            if let Err(e) = stopper.stop(grace).await {
                                debug!("Stop after reported error failed: {}", e);
                            }
                        });
                    }
                }
            }
        };
        drop(guard);

        let report = collect_report(drain).await;
        // The drain may have been given up on while the match was in flight.
        if error_armed && reported_error.is_none() {
            reported_error = error_rx.try_recv().ok();
        }
        let error_line = report.error_line.or(reported_error);
        let exit_code = exit_result?;
        let finished_at = Utc::now();

        let status = if interrupted {
            RunStatus::Interrupted
        } else if let Some(line) = error_line {
            RunStatus::Failed(RuntimeFailure::TriggerMatched { line, exit_code })
        } else if exit_code != 0 {
            RunStatus::Failed(RuntimeFailure::NonZeroExit { exit_code })
        } else {
            RunStatus::Succeeded
        };

        info!(
            "Container {} finished with exit code {} ({} lines of output)",
            name, exit_code, report.lines_seen
        );

        Ok(RunOutcome {
            container_name: name,
            exit_code: Some(exit_code),
            status,
            browser_url: report.browser_url,
            warnings: Vec::new(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        })
    }
}

/// Graceful stop, escalating to a kill on timeout or a second interrupt.
async fn terminate(
    name: &str,
    control: &Arc<dyn ContainerControl>,
    exit: &mut BoxFuture<'static, RunnerResult<i64>>,
    guard: &mut Option<InterruptGuard>,
    grace: Duration,
) -> RunnerResult<i64> {
    // The stop request can block for the whole grace period, so it runs on
    // its own while exit and a second interrupt are watched here.
    let stopper = control.clone();
    let stop_task = tokio::spawn(async move { stopper.stop(grace).await });

    let graceful = tokio::select! {
        result = tokio::time::timeout(grace + STOP_MARGIN, &mut *exit) => match result {
            Ok(result) => Some(result),
            Err(_) => {
                warn!("Container {} did not stop within {:?}, killing", name, grace + STOP_MARGIN);
                None
            }
        },
        Some(()) = next_interrupt(guard) => {
            warn!("Second interrupt received, killing container {}", name);
            None
        }
    };

    let result = match graceful {
        Some(result) => result,
        None => {
            *guard = None;
            if let Err(e) = control.kill().await {
                warn!("Failed to kill container {}: {}", name, e);
            }
            match tokio::time::timeout(KILL_TIMEOUT, &mut *exit).await {
                Ok(result) => result,
                Err(_) => Err(RunnerError::Supervision(format!(
                    "container {} did not exit after kill",
                    name
                ))),
            }
        }
    };

    match tokio::time::timeout(STOP_MARGIN, stop_task).await {
        Ok(Ok(Err(e))) => debug!("Stop request for {} failed: {}", name, e),
        Ok(Err(e)) => debug!("Stop request for {} was cancelled: {}", name, e),
        Err(_) => debug!("Stop request for {} still pending, detaching", name),
        Ok(Ok(Ok(()))) => {}
    }

    result
}

async fn collect_report(drain: Option<JoinHandle<TriggerReport>>) -> TriggerReport {
    let Some(mut handle) = drain else {
        return TriggerReport::default();
    };

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            TriggerReport::default()
        }
        Err(_) => {
            warn!("Output was still open {:?} after exit; giving up on it", DRAIN_TIMEOUT);
            handle.abort();
            TriggerReport::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{TriggerAction, TriggerSet};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        urls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl BrowserLauncher for Recorder {
        fn open(&self, url: &str) -> std::io::Result<()> {
            self.urls.lock().push(url.to_string());
            if self.fail {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no browser"))
            } else {
                Ok(())
            }
        }
    }

    fn matcher() -> OutputTriggerMatcher {
        OutputTriggerMatcher::new(
            Some(TriggerSet::new(
                TriggerAction::OpenBrowser,
                vec!["Server running at".to_string()],
            )),
            Some(TriggerSet::new(TriggerAction::FailRun, vec!["FATAL:".to_string()])),
        )
    }

    #[tokio::test]
    async fn test_drain_reads_every_line_in_order() {
        let (tx, rx) = mpsc::channel(2);
        let recorder = Arc::new(Recorder::default());
        let (error_tx, error_rx) = oneshot::channel();

        let drain = tokio::spawn(drain_output(
            rx,
            matcher(),
            recorder.clone(),
            OutputEcho::silent(),
            Some(error_tx),
        ));

        for i in 0..50 {
            tx.send(LogLine::stdout(format!("line {}", i))).await.unwrap();
        }
        tx.send(LogLine::stdout("Server running at http://localhost:1234"))
            .await
            .unwrap();
        tx.send(LogLine::stderr("FATAL: rule parse error")).await.unwrap();
        tx.send(LogLine::stdout("Server running at http://localhost:5678"))
            .await
            .unwrap();
        drop(tx);

        let report = drain.await.unwrap();
        assert_eq!(report.lines_seen, 53);
        assert_eq!(report.browser_url.as_deref(), Some("http://localhost:1234"));
        assert_eq!(report.error_line.as_deref(), Some("FATAL: rule parse error"));
        assert_eq!(*recorder.urls.lock(), vec!["http://localhost:1234"]);
        assert_eq!(error_rx.await.unwrap(), "FATAL: rule parse error");
    }

    #[tokio::test]
    async fn test_browser_failure_is_swallowed() {
        let (tx, rx) = mpsc::channel(4);
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });

        tx.send(LogLine::stdout("Server running at http://localhost:1234"))
            .await
            .unwrap();
        tx.send(LogLine::stdout("still scanning")).await.unwrap();
        drop(tx);

        let report = drain_output(rx, matcher(), recorder.clone(), OutputEcho::silent(), None).await;
        assert_eq!(report.lines_seen, 2);
        assert_eq!(recorder.urls.lock().len(), 1);
        assert!(report.error_line.is_none());
    }

    /// Control whose stop request blocks for a long time, like
    /// `docker stop -t` on a container that ignores SIGTERM.
    #[derive(Default)]
    struct SlowStop {
        stops: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ContainerControl for SlowStop {
        async fn stop(&self, _grace: Duration) -> RunnerResult<()> {
            *self.stops.lock() += 1;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn kill(&self) -> RunnerResult<()> {
            Ok(())
        }
    }

    fn plan() -> SupervisionPlan {
        SupervisionPlan {
            attach_output: true,
            interrupt_enabled: false,
            browser_triggers: None,
            error_exit_triggers: Some(TriggerSet::new(
                TriggerAction::FailRun,
                vec!["FATAL:".to_string()],
            )),
            stop_grace_period: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_exit_observed_while_error_stop_pending() {
        let (tx, rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel::<i64>();
        let control = Arc::new(SlowStop::default());
        let container = SpawnedContainer {
            name: "privscan-slowstop".to_string(),
            control: control.clone(),
            output: Some(rx),
            exit: Box::pin(async move {
                exit_rx
                    .await
                    .map_err(|e| RunnerError::Supervision(e.to_string()))
            }),
        };

        let feeder = async move {
            tx.send(LogLine::stderr("FATAL: rule parse error")).await.unwrap();
            while *control.stops.lock() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            drop(tx);
            exit_tx.send(1).unwrap();
        };

        let supervisor = ProcessSupervisor::new(Arc::new(Recorder::default()));
        let plan = plan();
        let (outcome, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(supervisor.supervise(container, &plan, None), feeder) },
        )
        .await
        .expect("supervisor kept waiting on the stop request");

        assert_eq!(
            outcome.unwrap().status,
            RunStatus::Failed(RuntimeFailure::TriggerMatched {
                line: "FATAL: rule parse error".to_string(),
                exit_code: 1,
            })
        );
    }

    #[tokio::test]
    async fn test_error_line_kept_when_output_outlives_exit() {
        let (tx, rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel::<i64>();
        let container = SpawnedContainer {
            name: "privscan-lingering".to_string(),
            control: Arc::new(SlowStop::default()),
            output: Some(rx),
            exit: Box::pin(async move {
                exit_rx
                    .await
                    .map_err(|e| RunnerError::Supervision(e.to_string()))
            }),
        };

        // The sender stays open past the exit, as with a backgrounded child
        // that inherited the container's stdout.
        tx.send(LogLine::stdout("FATAL: rule parse error")).await.unwrap();
        exit_tx.send(0).unwrap();

        let supervisor = ProcessSupervisor::new(Arc::new(Recorder::default()));
        let outcome = supervisor.supervise(container, &plan(), None).await.unwrap();
        drop(tx);

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(
            outcome.status,
            RunStatus::Failed(RuntimeFailure::TriggerMatched {
                line: "FATAL: rule parse error".to_string(),
                exit_code: 0,
            })
        );
    }

    #[tokio::test]
    async fn test_collect_report_without_drain() {
        assert_eq!(collect_report(None).await, TriggerReport::default());
    }
}
