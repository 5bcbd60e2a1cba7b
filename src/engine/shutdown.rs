//! Process-wide shutdown.
//!
//! Every watch and walk loop observes the same `CancellationToken`.
//! Cancelling it is idempotent, so loops that already stopped on their own
//! (a watch loop after a watch error) are unaffected. The coordinator then
//! joins every loop against one shared deadline and abandons whatever is
//! still running when it passes.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::walk_loop::WalkExit;
use super::watch_loop::WatchExit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Watch,
    Walk,
}

/// Identifies one loop of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopId {
    pub user: String,
    pub kind: LoopKind,
}

impl LoopId {
    pub fn watch(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            kind: LoopKind::Watch,
        }
    }

    pub fn walk(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            kind: LoopKind::Walk,
        }
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LoopKind::Watch => "watch",
            LoopKind::Walk => "walk",
        };
        write!(f, "{kind} loop of {}", self.user)
    }
}

/// Terminal value of a loop task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Watch(WatchExit),
    Walk(WalkExit),
}

impl From<WatchExit> for LoopExit {
    fn from(exit: WatchExit) -> Self {
        LoopExit::Watch(exit)
    }
}

impl From<WalkExit> for LoopExit {
    fn from(exit: WalkExit) -> Self {
        LoopExit::Walk(exit)
    }
}

/// How one loop ended during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Exited(LoopExit),
    /// The task panicked or was cancelled by the runtime.
    Failed(String),
    /// Still running at the deadline; aborted.
    Abandoned,
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<(LoopId, LoopOutcome)>,
}

impl ShutdownReport {
    /// Loops that did not stop before the deadline.
    pub fn abandoned(&self) -> Vec<&LoopId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == LoopOutcome::Abandoned)
            .map(|(id, _)| id)
            .collect()
    }

    /// Whether every loop reached a terminal state on its own.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, LoopOutcome::Exited(_)))
    }
}

/// Owns the shutdown token and the handles of every loop task.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Vec<(LoopId, JoinHandle<LoopExit>)>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
            timeout,
        }
    }

    /// Token observed by every loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a loop task and track it for shutdown.
    pub fn spawn<F, E>(&mut self, id: LoopId, task: F)
    where
        F: Future<Output = E> + Send + 'static,
        E: Into<LoopExit>,
    {
        let handle = tokio::spawn(async move { task.await.into() });
        self.tasks.push((id, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop and wait for them, at most until the timeout.
    pub async fn shutdown(self) -> ShutdownReport {
        self.token.cancel();
        let deadline = Instant::now() + self.timeout;
        let mut report = ShutdownReport::default();

        for (id, mut handle) in self.tasks {
            let outcome = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(exit)) => {
                    tracing::debug!(loop_id = %id, exit = ?exit, "loop stopped");
                    LoopOutcome::Exited(exit)
                }
                Ok(Err(e)) => {
                    tracing::error!(loop_id = %id, error = %e, "loop task failed");
                    LoopOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(loop_id = %id, "loop did not stop in time, abandoning it");
                    handle.abort();
                    LoopOutcome::Abandoned
                }
            };
            report.outcomes.push((id, outcome));
        }
        report
    }
}

/// Run `future` to completion on `runtime`, then shut the runtime down
/// without waiting longer than `grace` for blocking tasks.
///
/// Walks run on the blocking pool and cannot be aborted. Dropping the
/// runtime would wait for a walk stuck in the filesystem indefinitely.
pub fn block_on_bounded<F: Future>(runtime: Runtime, future: F, grace: Duration) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    output
}

/// Wait for SIGINT, or SIGTERM on Unix. Returns the signal name.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}
