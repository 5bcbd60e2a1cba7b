pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod registry;
pub mod server;
pub mod sink;
pub mod walker;
pub mod watcher;

pub use config::{Config, WatchPolicy};
pub use engine::Engine;
pub use engine::shutdown::{ShutdownCoordinator, ShutdownReport};
pub use entity::{Entity, MaildirCounts};
pub use error::{MaildirError, Result};
pub use registry::discover;
pub use sink::{Gauge, MemorySink, MetricSink, PrometheusSink, SeriesKey};
pub use walker::{WalkItem, WalkResult, walk_tree};
pub use watcher::{ChangeEvent, ChangeKind, WatchSubscription};
