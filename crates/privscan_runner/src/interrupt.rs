//! Host interrupt handling scoped to a single run.
//!
//! An [`InterruptGuard`] listens for interrupts from the moment it is
//! installed until it is dropped. The supervisor owns the guard for exactly
//! one run, so a later run never sees an earlier run's listener.

use tokio::sync::broadcast;
use tracing::warn;

/// Where interrupts come from.
#[derive(Debug, Clone, Default)]
pub enum InterruptSource {
    /// SIGINT and SIGTERM on Unix, Ctrl+C on Windows
    #[default]
    Signals,
    /// Interrupts raised through an [`InterruptTrigger`]
    Manual(broadcast::Sender<()>),
}

impl InterruptSource {
    /// A source driven by hand, plus the trigger that drives it.
    pub fn manual() -> (InterruptTrigger, Self) {
        let (tx, _) = broadcast::channel(8);
        (InterruptTrigger { tx: tx.clone() }, Self::Manual(tx))
    }

    /// Start listening. The listener lives as long as the returned guard.
    pub fn install(&self) -> InterruptGuard {
        let inner = match self {
            Self::Signals => install_signals(),
            Self::Manual(tx) => GuardInner::Manual(tx.subscribe()),
        };
        InterruptGuard { inner }
    }
}

/// Raises interrupts for an [`InterruptSource::Manual`] source.
#[derive(Debug, Clone)]
pub struct InterruptTrigger {
    tx: broadcast::Sender<()>,
}

impl InterruptTrigger {
    /// Raise an interrupt. Returns false when no run is listening.
    pub fn interrupt(&self) -> bool {
        self.tx.send(()).is_ok()
    }

    /// Number of installed guards.
    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

enum GuardInner {
    #[cfg(unix)]
    Signals {
        interrupt: tokio::signal::unix::Signal,
        terminate: tokio::signal::unix::Signal,
    },
    #[cfg(windows)]
    CtrlC(tokio::signal::windows::CtrlC),
    Manual(broadcast::Receiver<()>),
    /// Installation failed; never fires
    Disarmed,
}

#[cfg(unix)]
fn install_signals() -> GuardInner {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(interrupt), Ok(terminate)) => GuardInner::Signals {
            interrupt,
            terminate,
        },
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install interrupt handler: {}", e);
            GuardInner::Disarmed
        }
    }
}

#[cfg(windows)]
fn install_signals() -> GuardInner {
    match tokio::signal::windows::ctrl_c() {
        Ok(ctrl_c) => GuardInner::CtrlC(ctrl_c),
        Err(e) => {
            warn!("Failed to install interrupt handler: {}", e);
            GuardInner::Disarmed
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn install_signals() -> GuardInner {
    warn!("Interrupt handling is not supported on this platform");
    GuardInner::Disarmed
}

/// Active interrupt listener for one run.
pub struct InterruptGuard {
    inner: GuardInner,
}

impl InterruptGuard {
    /// Wait for the next interrupt. `None` means no more can arrive.
    pub async fn recv(&mut self) -> Option<()> {
        match &mut self.inner {
            #[cfg(unix)]
            GuardInner::Signals {
                interrupt,
                terminate,
            } => {
                tokio::select! {
                    received = interrupt.recv() => received,
                    received = terminate.recv() => received,
                }
            }
            #[cfg(windows)]
            GuardInner::CtrlC(ctrl_c) => ctrl_c.recv().await,
            GuardInner::Manual(rx) => match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(()),
                Err(broadcast::error::RecvError::Closed) => None,
            },
            GuardInner::Disarmed => None,
        }
    }
}

impl std::fmt::Debug for InterruptGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            #[cfg(unix)]
            GuardInner::Signals { .. } => "signals",
            #[cfg(windows)]
            GuardInner::CtrlC(_) => "ctrl_c",
            GuardInner::Manual(_) => "manual",
            GuardInner::Disarmed => "disarmed",
        };
        f.debug_struct("InterruptGuard").field("source", &kind).finish()
    }
}

/// Next interrupt from an optional guard; pends forever without one.
pub async fn next_interrupt(guard: &mut Option<InterruptGuard>) -> Option<()> {
    match guard {
        Some(guard) => guard.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_interrupt_scoped_to_guard() {
        let (trigger, source) = InterruptSource::manual();
        assert!(!trigger.interrupt(), "nobody listening yet");

        let mut guard = source.install();
        assert_eq!(trigger.listeners(), 1);
        assert!(trigger.interrupt());
        assert_eq!(guard.recv().await, Some(()));

        drop(guard);
        assert_eq!(trigger.listeners(), 0);
        assert!(!trigger.interrupt());
    }

    #[tokio::test]
    async fn test_new_guard_does_not_see_old_interrupts() {
        let (trigger, source) = InterruptSource::manual();
        let first = source.install();
        assert!(trigger.interrupt());
        drop(first);

        let mut second = source.install();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), second.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_next_interrupt_without_guard_pends() {
        let mut none: Option<InterruptGuard> = None;
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), next_interrupt(&mut none))
                .await;
        assert!(pending.is_err());
    }
}
