//! Trigger phrase matching over engine output.
//!
//! The matcher is a pure state machine: it is fed lines in order and reports
//! which actions became due. Each trigger set has its own fired flag, so an
//! action fires at most once per run regardless of what the other set does.

use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;

use crate::command::SupervisionPlan;
use crate::options::TriggerSet;

/// Characters that end a sentence rather than a URL.
const URL_TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"'];

/// Action that became due on a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    OpenBrowser { url: String, line: String },
    FailRun { line: String },
}

/// Outcome of matching a whole run's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// URL the browser was opened at
    pub browser_url: Option<String>,
    /// First line that matched an error-exit phrase
    pub error_line: Option<String>,
    /// Number of lines inspected
    pub lines_seen: usize,
}

/// Matches output lines against the browser and error-exit trigger sets.
#[derive(Debug, Clone, Default)]
pub struct OutputTriggerMatcher {
    browser: Option<TriggerSet>,
    error_exit: Option<TriggerSet>,
    browser_url: Option<String>,
    error_line: Option<String>,
    lines_seen: usize,
}

impl OutputTriggerMatcher {
    pub fn new(browser: Option<TriggerSet>, error_exit: Option<TriggerSet>) -> Self {
        Self {
            browser,
            error_exit,
            ..Self::default()
        }
    }

    pub fn from_plan(plan: &SupervisionPlan) -> Self {
        Self::new(plan.browser_triggers.clone(), plan.error_exit_triggers.clone())
    }

    /// Inspect one line. Both sets are checked independently; a line can arm
    /// both actions.
    pub fn observe(&mut self, line: &str) -> Vec<TriggerEvent> {
        self.lines_seen += 1;
        let mut events = Vec::new();

        if self.browser_url.is_none() {
            let url = self
                .browser
                .as_ref()
                .and_then(|set| set.find_in(line))
                .and_then(|phrase| extract_url(line, phrase));
            if let Some(url) = url {
                self.browser_url = Some(url.clone());
                events.push(TriggerEvent::OpenBrowser {
                    url,
                    line: line.to_string(),
                });
            }
        }

        if self.error_line.is_none() {
            let matched = self
                .error_exit
                .as_ref()
                .is_some_and(|set| set.find_in(line).is_some());
            if matched {
                self.error_line = Some(line.to_string());
                events.push(TriggerEvent::FailRun {
                    line: line.to_string(),
                });
            }
        }

        events
    }

    pub fn into_report(self) -> TriggerReport {
        TriggerReport {
            browser_url: self.browser_url,
            error_line: self.error_line,
            lines_seen: self.lines_seen,
        }
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"https?://[^\s<>"'`]+"#).expect("URL pattern is valid")
    })
}

/// Find the URL a trigger line points at.
///
/// The text after the trigger phrase is searched first, then the whole line.
pub fn extract_url(line: &str, phrase: &str) -> Option<String> {
    let after_phrase = line
        .find(phrase)
        .map(|start| &line[start + phrase.len()..])
        .unwrap_or("");

    [after_phrase, line]
        .into_iter()
        .find_map(|haystack| url_pattern().find(haystack))
        .map(|m| m.as_str().trim_end_matches(URL_TRAILING_PUNCTUATION).to_string())
        .filter(|url| !url.ends_with("://"))
}

/// Opens URLs in a browser. Failures are for logging only.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Launches the platform's default browser without waiting for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        let mut cmd = if cfg!(target_os = "macos") {
            let mut cmd = tokio::process::Command::new("open");
            cmd.arg(url);
            cmd
        } else if cfg!(windows) {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.args(["/C", "start", "", url]);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("xdg-open");
            cmd.arg(url);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
    }
}
