//! The per-user walk loop.
//!
//! Owns the user's [`Entity`]. Every trigger runs one walk on the blocking
//! pool, subscribes the directories the walk found, and publishes the result.
//! When the structure checksum changes, the size series keyed by the old
//! checksum is deleted before the new one is published, so each user has a
//! single live size series.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WatchPolicy;
use crate::entity::Entity;
use crate::sink::{Gauge, MetricSink, SeriesKey};
use crate::walker::{WalkResult, walk_tree};
use crate::watcher::WatchSubscription;

/// Sending half of a user's trigger channel.
#[derive(Debug, Clone)]
pub struct TriggerSender(mpsc::Sender<()>);

/// Result of [`TriggerSender::fire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new re-walk request was queued.
    Queued,
    /// A re-walk was already pending; this request merged into it.
    Coalesced,
    /// The walk loop has exited.
    Closed,
}

impl TriggerSender {
    /// Request a re-walk without waiting.
    pub fn fire(&self) -> TriggerOutcome {
        match self.0.try_send(()) {
            Ok(()) => TriggerOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(())) => TriggerOutcome::Coalesced,
            Err(mpsc::error::TrySendError::Closed(())) => TriggerOutcome::Closed,
        }
    }
}

/// Create a trigger channel holding at most one pending request.
pub fn trigger_channel() -> (TriggerSender, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (TriggerSender(tx), rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState {
    Idle,
    Walking,
}

/// Why a walk loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkExit {
    Shutdown,
}

pub struct WalkLoop {
    entity: Entity,
    subscription: Arc<WatchSubscription>,
    policy: Arc<WatchPolicy>,
    sink: Arc<dyn MetricSink>,
    triggers: mpsc::Receiver<()>,
    shutdown: CancellationToken,
    state: WalkState,
}

impl WalkLoop {
    pub fn new(
        entity: Entity,
        subscription: Arc<WatchSubscription>,
        policy: Arc<WatchPolicy>,
        sink: Arc<dyn MetricSink>,
        triggers: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            entity,
            subscription,
            policy,
            sink,
            triggers,
            shutdown,
            state: WalkState::Idle,
        }
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    /// Process triggers until shutdown.
    ///
    /// Once every trigger sender is gone (the watch loop stopped) the loop
    /// stays dormant until shutdown.
    pub async fn run(mut self) -> WalkExit {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                trigger = self.triggers.recv() => match trigger {
                    Some(()) => self.walk_once().await,
                    None => {
                        tracing::debug!(
                            user = %self.entity.user(),
                            "no more triggers, walk loop dormant until shutdown"
                        );
                        self.shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }
        tracing::info!(user = %self.entity.user(), "done walking maildir");
        WalkExit::Shutdown
    }

    /// Run one walk and publish its result.
    ///
    /// A failed walk publishes nothing and leaves the last checksum alone.
    pub async fn walk_once(&mut self) {
        self.state = WalkState::Walking;

        let root = self.entity.path().to_path_buf();
        let policy = Arc::clone(&self.policy);
        let subscription = Arc::clone(&self.subscription);
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || {
            walk_tree(&root, &policy, |dir| subscription.watch(dir).map(|_| ()))
        })
        .await;

        self.state = WalkState::Idle;

        match outcome {
            Ok(Ok(result)) => {
                self.sink.observe_walk_duration(started.elapsed().as_secs_f64());
                self.publish(result);
            }
            Ok(Err(e)) => {
                tracing::error!(
                    user = %self.entity.user(),
                    error = %e,
                    "error while walking user maildir"
                );
            }
            Err(e) => {
                tracing::error!(
                    user = %self.entity.user(),
                    error = %e,
                    "maildir walk task failed"
                );
            }
        }
    }

    fn publish(&mut self, result: WalkResult) {
        let user = self.entity.user().to_string();
        let counts = result.counts;

        let changed = self.entity.last_checksum() != Some(result.checksum.as_str());
        if changed {
            match self.entity.last_checksum() {
                Some(old) => {
                    match self.sink.delete_series(Gauge::Size, SeriesKey::sized(&user, old)) {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(
                            user = %user,
                            checksum = %old,
                            "outdated size series was not found"
                        ),
                        Err(e) => tracing::warn!(
                            user = %user,
                            checksum = %old,
                            error = %e,
                            "failed to delete outdated size series"
                        ),
                    }
                }
                None => tracing::warn!(
                    user = %user,
                    "outdated size series was not found, first walk of this maildir"
                ),
            }
        }

        for (gauge, value) in [
            (Gauge::Elements, counts.elements),
            (Gauge::Folders, counts.folders),
            (Gauge::Files, counts.files),
        ] {
            if let Err(e) = self
                .sink
                .set_gauge(gauge, SeriesKey::user(&user), value as f64)
            {
                tracing::warn!(user = %user, metric = gauge.name(), error = %e, "failed to publish metric");
            }
        }

        // With an unchanged checksum this only updates the value of the
        // existing series (file contents may have grown).
        if let Err(e) = self.sink.set_gauge(
            Gauge::Size,
            SeriesKey::sized(&user, &result.checksum),
            counts.size as f64,
        ) {
            tracing::warn!(user = %user, error = %e, "failed to publish size metric");
        }

        if let Some(previous) = self.entity.record_walk(result.checksum, counts) {
            tracing::debug!(
                user = %user,
                previous = %previous,
                checksum = %self.entity.last_checksum().unwrap_or_default(),
                "maildir structure changed"
            );
        }
        tracing::debug!(
            user = %user,
            elements = counts.elements,
            folders = counts.folders,
            files = counts.files,
            size = counts.size,
            items = result.items.len(),
            "published maildir metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::sink::MemorySink;

    struct Fixture {
        _tmp: TempDir,
        root: std::path::PathBuf,
        sink: Arc<MemorySink>,
        trigger: TriggerSender,
        shutdown: CancellationToken,
        walk_loop: WalkLoop,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("alice");
        fs::create_dir_all(root.join("cur")).unwrap();
        fs::write(root.join("cur").join("1"), [b'x'; 10]).unwrap();

        let sink = Arc::new(MemorySink::new());
        let (subscription, _events) = WatchSubscription::open("alice", &root).unwrap();
        let (trigger, triggers) = trigger_channel();
        let shutdown = CancellationToken::new();
        let walk_loop = WalkLoop::new(
            Entity::new("alice", &root),
            subscription,
            Arc::new(WatchPolicy::default()),
            sink.clone(),
            triggers,
            shutdown.clone(),
        );

        Fixture {
            _tmp: tmp,
            root,
            sink,
            trigger,
            shutdown,
            walk_loop,
        }
    }

    #[tokio::test]
    async fn test_first_walk_publishes_counts_and_size() {
        let mut f = fixture();
        f.walk_loop.walk_once().await;

        let user = SeriesKey::user("alice");
        assert_eq!(f.sink.get(Gauge::Elements, user), Some(2.0));
        assert_eq!(f.sink.get(Gauge::Folders, user), Some(1.0));
        assert_eq!(f.sink.get(Gauge::Files, user), Some(1.0));

        let checksum = f.sink.live_checksum("alice").expect("one size series");
        assert_eq!(f.walk_loop.entity.last_checksum(), Some(checksum.as_str()));
        assert_eq!(
            f.sink.get(Gauge::Size, SeriesKey::sized("alice", &checksum)),
            Some(10.0)
        );
        assert_eq!(f.walk_loop.state(), WalkState::Idle);
        assert_eq!(f.sink.walk_count(), 1);
    }

    #[tokio::test]
    async fn test_first_walk_subscribes_root_and_policy_folders() {
        let mut f = fixture();
        fs::create_dir(f.root.join("new")).unwrap();
        f.walk_loop.walk_once().await;

        assert_eq!(
            f.walk_loop.subscription.watched_paths(),
            vec![f.root.clone(), f.root.join("cur")]
        );
    }

    #[tokio::test]
    async fn test_checksum_change_replaces_size_series() {
        let mut f = fixture();
        f.walk_loop.walk_once().await;
        let old = f.sink.live_checksum("alice").unwrap();

        fs::write(f.root.join("cur").join("2"), [b'y'; 20]).unwrap();
        f.walk_loop.walk_once().await;

        let new = f.sink.live_checksum("alice").expect("exactly one size series");
        assert_ne!(old, new);
        assert_eq!(f.sink.get(Gauge::Size, SeriesKey::sized("alice", &old)), None);
        assert_eq!(
            f.sink.get(Gauge::Size, SeriesKey::sized("alice", &new)),
            Some(30.0)
        );
        assert_eq!(f.sink.get(Gauge::Elements, SeriesKey::user("alice")), Some(3.0));
        assert_eq!(f.sink.get(Gauge::Files, SeriesKey::user("alice")), Some(2.0));
    }

    #[tokio::test]
    async fn test_unchanged_checksum_keeps_series_and_updates_size() {
        let mut f = fixture();
        f.walk_loop.walk_once().await;
        let checksum = f.sink.live_checksum("alice").unwrap();

        fs::write(f.root.join("cur").join("1"), [b'x'; 15]).unwrap();
        f.walk_loop.walk_once().await;

        assert_eq!(f.sink.live_checksum("alice"), Some(checksum.clone()));
        assert_eq!(
            f.sink.get(Gauge::Size, SeriesKey::sized("alice", &checksum)),
            Some(15.0)
        );
        assert_eq!(f.sink.set_calls(Gauge::Elements), 2);
    }

    #[tokio::test]
    async fn test_failed_walk_publishes_nothing() {
        let mut f = fixture();
        f.walk_loop.walk_once().await;
        let checksum = f.sink.live_checksum("alice").unwrap();

        fs::remove_dir_all(&f.root).unwrap();
        f.walk_loop.walk_once().await;

        assert_eq!(f.sink.set_calls(Gauge::Elements), 1);
        assert_eq!(f.sink.live_checksum("alice"), Some(checksum.clone()));
        assert_eq!(f.walk_loop.entity.last_checksum(), Some(checksum.as_str()));
        assert_eq!(f.sink.walk_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_walk_self_corrects() {
        let mut f = fixture();
        fs::rename(&f.root, f.root.with_extension("away")).unwrap();
        f.walk_loop.walk_once().await;
        assert_eq!(f.sink.set_calls(Gauge::Elements), 0);

        fs::rename(f.root.with_extension("away"), &f.root).unwrap();
        f.walk_loop.walk_once().await;
        assert_eq!(f.sink.get(Gauge::Files, SeriesKey::user("alice")), Some(1.0));
    }

    #[tokio::test]
    async fn test_sink_failures_do_not_abort_walk() {
        let mut f = fixture();
        f.walk_loop.walk_once().await;

        f.sink.fail_deletes(true);
        fs::write(f.root.join("cur").join("2"), "x").unwrap();
        f.walk_loop.walk_once().await;

        // The stale series could not be deleted, but the new one is published
        // and the entity moved on to the new checksum.
        assert_eq!(f.sink.series_for(Gauge::Size, "alice").len(), 2);
        assert_eq!(f.sink.get(Gauge::Files, SeriesKey::user("alice")), Some(2.0));
        assert!(f.sink.live_checksum("alice").is_none());
        let current = f.walk_loop.entity.last_checksum().unwrap().to_string();
        assert!(
            f.sink
                .get(Gauge::Size, SeriesKey::sized("alice", &current))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_failed_publish_is_corrected_by_next_walk() {
        let mut f = fixture();
        f.sink.fail_sets(true);
        f.walk_loop.walk_once().await;

        assert_eq!(f.sink.set_calls(Gauge::Elements), 0);
        assert!(f.sink.series_for(Gauge::Size, "alice").is_empty());
        let checksum = f.walk_loop.entity.last_checksum().unwrap().to_string();
        assert_eq!(f.walk_loop.entity.counts().files, 1);

        f.sink.fail_sets(false);
        f.walk_loop.walk_once().await;
        assert_eq!(f.sink.get(Gauge::Files, SeriesKey::user("alice")), Some(1.0));
        assert_eq!(f.sink.live_checksum("alice"), Some(checksum));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_walk_warns_about_missing_series() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut f = fixture();
        f.walk_loop.walk_once().await;

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("outdated size series was not found"));
    }

    #[tokio::test]
    async fn test_pending_triggers_coalesce_into_one_walk() {
        let f = fixture();

        assert_eq!(f.trigger.fire(), TriggerOutcome::Queued);
        for _ in 0..9 {
            assert_eq!(f.trigger.fire(), TriggerOutcome::Coalesced);
        }

        let sink = f.sink.clone();
        let shutdown = f.shutdown.clone();
        let handle = tokio::spawn(f.walk_loop.run());

        timeout(Duration::from_secs(3), async {
            while sink.walk_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("walk should happen");
        // Give a spurious second walk the chance to show up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.walk_count(), 1);

        shutdown.cancel();
        let exit = timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert_eq!(exit, WalkExit::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_skips_queued_trigger() {
        let f = fixture();
        f.trigger.fire();
        f.shutdown.cancel();

        let exit = f.walk_loop.run().await;
        assert_eq!(exit, WalkExit::Shutdown);
        assert_eq!(f.sink.walk_count(), 0);
    }

    #[tokio::test]
    async fn test_dormant_after_triggers_close() {
        let f = fixture();
        let shutdown = f.shutdown.clone();
        drop(f.trigger);
        let handle = tokio::spawn(f.walk_loop.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        let exit = timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert_eq!(exit, WalkExit::Shutdown);
    }

    #[test]
    fn test_trigger_closed_after_receiver_drop() {
        let (trigger, rx) = trigger_channel();
        drop(rx);
        assert_eq!(trigger.fire(), TriggerOutcome::Closed);
    }
}
