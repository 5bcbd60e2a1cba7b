//! Per-user concurrent watch/walk engine.
//!
//! Every discovered entity gets a [`watch_loop::WatchLoop`] and a
//! [`walk_loop::WalkLoop`] connected by a coalescing trigger channel. Users
//! never share mutable state, so a failure in one user's loops does not
//! affect any other user.

pub mod shutdown;
pub mod walk_loop;
pub mod watch_loop;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::WatchPolicy;
use crate::entity::Entity;
use crate::sink::MetricSink;
use crate::watcher::WatchSubscription;

use self::shutdown::{LoopId, ShutdownCoordinator, ShutdownReport};
use self::walk_loop::{WalkLoop, trigger_channel};
use self::watch_loop::WatchLoop;

/// The running set of per-user loops.
pub struct Engine {
    users: Vec<String>,
    coordinator: ShutdownCoordinator,
}

impl Engine {
    /// Spawn the loops of every entity and request an initial walk for each.
    ///
    /// Must be called from within a tokio runtime. An entity whose watch
    /// subscription cannot be created is logged and skipped.
    pub fn start(
        entities: Vec<Entity>,
        policy: WatchPolicy,
        sink: Arc<dyn MetricSink>,
        shutdown_timeout: Duration,
    ) -> Self {
        let policy = Arc::new(policy);
        let mut coordinator = ShutdownCoordinator::new(shutdown_timeout);
        let mut users = Vec::with_capacity(entities.len());

        for entity in entities {
            let user = entity.user().to_string();
            let (subscription, events) = match WatchSubscription::open(&user, entity.path()) {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::error!(user = %user, error = %e, "failed to set up maildir watch, skipping user");
                    continue;
                }
            };
            let (trigger, triggers) = trigger_channel();

            let walk_loop = WalkLoop::new(
                entity,
                Arc::clone(&subscription),
                Arc::clone(&policy),
                Arc::clone(&sink),
                triggers,
                coordinator.token(),
            );
            coordinator.spawn(LoopId::walk(&user), walk_loop.run());

            trigger.fire();
            let watch_loop = WatchLoop::new(subscription, events, trigger, coordinator.token());
            coordinator.spawn(LoopId::watch(&user), watch_loop.run());

            tracing::info!(user = %user, "watching maildir");
            users.push(user);
        }

        Self { users, coordinator }
    }

    /// Users whose loops are running.
    pub fn users(&self) -> &[String] {
        &self.users
    }

    /// Token that stops every loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.token()
    }

    /// Stop every loop, waiting at most for the configured timeout.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!(loops = self.coordinator.len(), "stopping maildir loops");
        self.coordinator.shutdown().await
    }
}
