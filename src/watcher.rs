//! Per-user filesystem change subscription.
//!
//! Each user maildir gets its own `notify::RecommendedWatcher`. Events are
//! bridged from notify's callback thread into a bounded tokio channel that the
//! user's watch loop consumes. Directories are subscribed non-recursively, one
//! by one, as walks discover them and as creation events announce them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{MaildirError, Result};

/// Capacity of the channel bridging notify events to the watch loop.
///
/// When it is full the callback drops events: the loop is busy with earlier
/// events, each of which already requests a re-walk.
const CHANNEL_CAPACITY: usize = 256;

/// Kind of a relevant filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
    Rename,
    Attribute,
}

/// A single filesystem change below a user's maildir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// What the watch loop receives from the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    Change(ChangeEvent),
    /// The watch subsystem failed or lost events; fatal for this user.
    Error(String),
}

/// Map a notify event kind to a change kind.
///
/// Access events and unclassified events carry no structural change. The
/// walker's own directory reads show up as access events, so they must not
/// cause a re-walk.
pub fn classify_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(ChangeKind::Attribute),
        EventKind::Modify(_) => Some(ChangeKind::Write),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(ChangeKind::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

/// Translate one notify callback result into watch messages.
pub fn translate(res: notify::Result<notify::Event>) -> Vec<WatchMessage> {
    match res {
        Ok(event) if event.need_rescan() => vec![WatchMessage::Error(
            "kernel event queue overflowed".to_string(),
        )],
        Ok(event) => match classify_event_kind(&event.kind) {
            Some(kind) => event
                .paths
                .into_iter()
                .map(|path| WatchMessage::Change(ChangeEvent { kind, path }))
                .collect(),
            None => Vec::new(),
        },
        Err(e) => vec![WatchMessage::Error(e.to_string())],
    }
}

/// Delivers translated notify results from the callback thread to the watch
/// loop without blocking.
///
/// Change events are dropped when the channel is full. Subsystem errors are
/// also kept in a separate slot, so a full channel can never hide them.
struct EventBridge {
    user: String,
    tx: mpsc::Sender<WatchMessage>,
    lagged: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl EventBridge {
    fn forward(&self, res: notify::Result<notify::Event>) {
        for message in translate(res) {
            if let WatchMessage::Error(e) = &message {
                self.failure.lock().get_or_insert_with(|| e.clone());
            }
            match self.tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !self.lagged.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            user = %self.user,
                            capacity = CHANNEL_CAPACITY,
                            "watch channel full, dropping change events"
                        );
                    }
                }
                // The watch loop is gone; nobody is listening.
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

struct SubscriptionState {
    watcher: Option<notify::RecommendedWatcher>,
    watched: BTreeSet<PathBuf>,
}

/// The set of directories of one user that are subscribed to change events.
///
/// Shared by the user's watch loop (which adds newly created directories)
/// and walk loop (which adds directories found during walks). Releasing the
/// subscription with [`WatchSubscription::close`] is idempotent.
pub struct WatchSubscription {
    user: String,
    root: PathBuf,
    state: Mutex<SubscriptionState>,
    lagged: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl WatchSubscription {
    /// Create the subscription for one user and the receiver its watch loop
    /// reads from. No directory is watched yet.
    pub fn open(
        user: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<WatchMessage>)> {
        let user = user.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let lagged = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let bridge = EventBridge {
            user: user.clone(),
            tx,
            lagged: Arc::clone(&lagged),
            failure: Arc::clone(&failure),
        };
        let watcher = notify::RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| bridge.forward(res),
            notify::Config::default(),
        )
        .map_err(|e| {
            MaildirError::WatchSubsystem(format!(
                "failed to create filesystem watcher for {user}: {e}"
            ))
        })?;

        let subscription = Arc::new(Self {
            user,
            root: root.into(),
            state: Mutex::new(SubscriptionState {
                watcher: Some(watcher),
                watched: BTreeSet::new(),
            }),
            lagged,
            failure,
        });
        Ok((subscription, rx))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to changes directly inside `dir`.
    ///
    /// The OS watch is (re-)added even if `dir` was subscribed before, since
    /// a directory that was removed and recreated loses its kernel watch.
    /// Returns `true` if `dir` was not in the watched set yet.
    pub fn watch(&self, dir: &Path) -> Result<bool> {
        let mut state = self.state.lock();
        let watcher = state.watcher.as_mut().ok_or_else(|| {
            MaildirError::WatchSubsystem(format!("subscription of {} is closed", self.user))
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(state.watched.insert(dir.to_path_buf()))
    }

    /// Directories currently in the watched set.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.state.lock().watched.iter().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().watcher.is_none()
    }

    /// Release the OS watches.
    ///
    /// Returns `true` only for the call that actually released them; later
    /// calls are no-ops.
    pub fn close(&self) -> bool {
        let watcher = self.state.lock().watcher.take();
        match watcher {
            Some(watcher) => {
                drop(watcher);
                tracing::debug!(user = %self.user, "released watch subscription");
                true
            }
            None => false,
        }
    }

    /// Whether events were dropped since the last call.
    pub fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::Relaxed)
    }

    /// The first subsystem error reported for this subscription, if any.
    ///
    /// Errors stay recorded here even when the event channel was full.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn record_failure(&self, reason: &str) {
        self.failure.lock().get_or_insert_with(|| reason.to_string());
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("user", &self.user)
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .finish()
    }
}
