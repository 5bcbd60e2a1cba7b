//! The per-user watch loop.
//!
//! Turns change events from the user's [`WatchSubscription`] into re-walk
//! triggers. Newly created directories are subscribed right away so changes
//! inside them are not missed before the next walk finishes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::watcher::{ChangeEvent, ChangeKind, WatchMessage, WatchSubscription};

use super::walk_loop::{TriggerOutcome, TriggerSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Running,
    Stopped,
}

/// Why a watch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchExit {
    Shutdown,
    /// The watch subsystem failed; only this user is affected.
    SubsystemError(String),
    /// The event channel closed underneath the loop.
    Disconnected,
}

pub struct WatchLoop {
    subscription: Arc<WatchSubscription>,
    events: mpsc::Receiver<WatchMessage>,
    trigger: TriggerSender,
    shutdown: CancellationToken,
    state: WatchState,
}

impl WatchLoop {
    pub fn new(
        subscription: Arc<WatchSubscription>,
        events: mpsc::Receiver<WatchMessage>,
        trigger: TriggerSender,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            events,
            trigger,
            shutdown,
            state: WatchState::Running,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Forward change events as triggers until shutdown or a watch error.
    ///
    /// The subscription is released on every exit path. The trigger sender
    /// is dropped with the loop, which leaves the paired walk loop dormant.
    pub async fn run(mut self) -> WatchExit {
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break WatchExit::Shutdown,
                message = self.events.recv() => match message {
                    Some(WatchMessage::Change(event)) => {
                        // An error may have been recorded while the channel was full.
                        if let Some(e) = self.subscription.failure() {
                            break self.subsystem_error(e);
                        }
                        self.handle_change(event);
                    }
                    Some(WatchMessage::Error(e)) => break self.subsystem_error(e),
                    None => break WatchExit::Disconnected,
                },
            }
        };
        self.stop();
        tracing::debug!(user = %self.subscription.user(), exit = ?exit, "done watching maildir");
        exit
    }

    fn subsystem_error(&self, e: String) -> WatchExit {
        tracing::error!(
            user = %self.subscription.user(),
            error = %e,
            "error occurred while watching maildir, stopping watch loop"
        );
        WatchExit::SubsystemError(e)
    }

    /// Move to `Stopped` and release the subscription. Safe to call again.
    fn stop(&mut self) {
        if self.state == WatchState::Stopped {
            return;
        }
        self.state = WatchState::Stopped;
        self.subscription.close();
    }

    fn handle_change(&self, event: ChangeEvent) {
        let user = self.subscription.user();
        if !event.path.starts_with(self.subscription.root()) {
            tracing::debug!(user = %user, path = %event.path.display(), "ignoring event outside maildir");
            return;
        }
        tracing::debug!(user = %user, kind = ?event.kind, path = %event.path.display(), "maildir change");

        if self.subscription.take_lagged() {
            tracing::info!(user = %user, "change events were dropped, re-walk will reconcile");
        }

        if event.kind == ChangeKind::Create {
            match std::fs::symlink_metadata(&event.path) {
                Ok(meta) if meta.is_dir() => {
                    if let Err(e) = self.subscription.watch(&event.path) {
                        tracing::warn!(
                            user = %user,
                            path = %event.path.display(),
                            error = %e,
                            "failed to watch new directory"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(
                    user = %user,
                    path = %event.path.display(),
                    error = %e,
                    "created path vanished before it could be inspected"
                ),
            }
        }

        if self.trigger.fire() == TriggerOutcome::Closed {
            tracing::debug!(user = %user, "walk loop has exited, trigger dropped");
        }
    }
}
