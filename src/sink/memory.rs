//! In-memory metric sink.
//!
//! Keeps every published series in a `DashMap` so tests can inspect exactly
//! what the walk loops published and deleted. Failures can be injected to
//! exercise the sink error paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::error::{MaildirError, Result};

use super::{Gauge, MetricSink, SeriesKey};

type SeriesId = (Gauge, String, Option<String>);

#[derive(Debug, Default)]
pub struct MemorySink {
    series: DashMap<SeriesId, f64>,
    set_calls: DashMap<Gauge, usize>,
    walk_durations: AtomicUsize,
    fail_sets: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one series, if published.
    pub fn get(&self, gauge: Gauge, key: SeriesKey<'_>) -> Option<f64> {
        self.series.get(&series_id(gauge, &key)).map(|v| *v.value())
    }

    /// All live series of `gauge` for `user`, as `(checksum, value)` pairs.
    pub fn series_for(&self, gauge: Gauge, user: &str) -> Vec<(Option<String>, f64)> {
        let mut found: Vec<_> = self
            .series
            .iter()
            .filter(|entry| entry.key().0 == gauge && entry.key().1 == user)
            .map(|entry| (entry.key().2.clone(), *entry.value()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Checksum of the single live size series for `user`.
    ///
    /// Returns `None` if there is no size series or more than one.
    pub fn live_checksum(&self, user: &str) -> Option<String> {
        match self.series_for(Gauge::Size, user).as_slice() {
            [(checksum, _)] => checksum.clone(),
            _ => None,
        }
    }

    /// Number of successful `set_gauge` calls for `gauge`.
    pub fn set_calls(&self, gauge: Gauge) -> usize {
        self.set_calls.get(&gauge).map(|c| *c.value()).unwrap_or(0)
    }

    /// Number of recorded walk durations.
    pub fn walk_count(&self) -> usize {
        self.walk_durations.load(Ordering::SeqCst)
    }

    /// Make subsequent `set_gauge` calls fail.
    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `delete_series` calls fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

fn series_id(gauge: Gauge, key: &SeriesKey<'_>) -> SeriesId {
    (
        gauge,
        key.user.to_string(),
        key.checksum.map(str::to_string),
    )
}

impl MetricSink for MemorySink {
    fn set_gauge(&self, gauge: Gauge, key: SeriesKey<'_>, value: f64) -> Result<()> {
        gauge.label_values(&key)?;
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(MaildirError::Sink("injected set failure".to_string()));
        }
        self.series.insert(series_id(gauge, &key), value);
        *self.set_calls.entry(gauge).or_insert(0) += 1;
        Ok(())
    }

    fn delete_series(&self, gauge: Gauge, key: SeriesKey<'_>) -> Result<bool> {
        gauge.label_values(&key)?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(MaildirError::Sink("injected delete failure".to_string()));
        }
        Ok(self.series.remove(&series_id(gauge, &key)).is_some())
    }

    fn observe_walk_duration(&self, _seconds: f64) {
        self.walk_durations.fetch_add(1, Ordering::SeqCst);
    }
}
