//! Metric sink abstraction.
//!
//! The walk loops publish through [`MetricSink`] instead of touching a global
//! registry, so the engine can run against the Prometheus registry in
//! production and against [`MemorySink`] in tests. Implementations must be
//! safe to call concurrently from every entity's walk loop.

pub mod memory;
pub mod prometheus;

pub use self::memory::MemorySink;
pub use self::prometheus::PrometheusSink;

use crate::error::{MaildirError, Result};

/// The gauges published for every entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gauge {
    Elements,
    Folders,
    Files,
    /// Aggregate byte size, keyed by user and checksum.
    Size,
}

impl Gauge {
    /// Gauges labeled by user only.
    pub const COUNTS: [Gauge; 3] = [Gauge::Elements, Gauge::Folders, Gauge::Files];

    pub fn name(self) -> &'static str {
        match self {
            Gauge::Elements => "maildir_elements_total",
            Gauge::Folders => "maildir_folders_total",
            Gauge::Files => "maildir_files_total",
            Gauge::Size => "maildir_size_bytes",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Gauge::Elements => "Number of folders and files in a user's maildir",
            Gauge::Folders => "Number of folders in a user's maildir",
            Gauge::Files => "Number of files in a user's maildir",
            Gauge::Size => "Aggregate file size of a user's maildir, labeled by structure checksum",
        }
    }

    pub fn label_names(self) -> &'static [&'static str] {
        match self {
            Gauge::Size => &["user", "checksum"],
            _ => &["user"],
        }
    }

    /// Label values for `key` in the order given by [`Gauge::label_names`].
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::Sink` if the key's shape does not match the
    /// gauge: the size gauge needs a checksum, the count gauges must not
    /// carry one.
    pub fn label_values<'a>(self, key: &SeriesKey<'a>) -> Result<Vec<&'a str>> {
        match (self, key.checksum) {
            (Gauge::Size, Some(checksum)) => Ok(vec![key.user, checksum]),
            (Gauge::Size, None) => Err(MaildirError::Sink(format!(
                "{} requires a checksum label",
                self.name()
            ))),
            (_, None) => Ok(vec![key.user]),
            (_, Some(_)) => Err(MaildirError::Sink(format!(
                "{} does not take a checksum label",
                self.name()
            ))),
        }
    }
}

/// Label set identifying one series of a gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesKey<'a> {
    pub user: &'a str,
    pub checksum: Option<&'a str>,
}

impl<'a> SeriesKey<'a> {
    /// Key for the count gauges.
    pub fn user(user: &'a str) -> Self {
        Self {
            user,
            checksum: None,
        }
    }

    /// Key for the size gauge.
    pub fn sized(user: &'a str, checksum: &'a str) -> Self {
        Self {
            user,
            checksum: Some(checksum),
        }
    }
}

/// Destination for published maildir metrics.
pub trait MetricSink: Send + Sync {
    /// Set the series of `gauge` identified by `key` to `value`.
    fn set_gauge(&self, gauge: Gauge, key: SeriesKey<'_>, value: f64) -> Result<()>;

    /// Delete a previously published series.
    ///
    /// Returns `Ok(false)` if no such series exists.
    fn delete_series(&self, gauge: Gauge, key: SeriesKey<'_>) -> Result<bool>;

    /// Record how long one successful walk took.
    fn observe_walk_duration(&self, _seconds: f64) {}
}
