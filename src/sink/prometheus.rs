//! Prometheus-backed metric sink.

use prometheus::{Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

use crate::error::{MaildirError, Result};

use super::{Gauge, MetricSink, SeriesKey};

/// Buckets of the walk duration histogram, in seconds.
const WALK_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08, 0.09, 0.10, 0.15, 0.20, 0.25, 0.30, 0.35,
    0.40, 0.45, 0.50, 1.0,
];

/// Metric sink writing into its own Prometheus [`Registry`].
///
/// `GaugeVec` is internally synchronised, so a single instance can be shared
/// by every walk loop.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Registry,
    elements: GaugeVec,
    folders: GaugeVec,
    files: GaugeVec,
    size: GaugeVec,
    walk_duration: Histogram,
}

impl PrometheusSink {
    /// Create the gauges and register them with a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let gauge = |gauge: Gauge| -> Result<GaugeVec> {
            let vec = GaugeVec::new(Opts::new(gauge.name(), gauge.help()), gauge.label_names())?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };
        let elements = gauge(Gauge::Elements)?;
        let folders = gauge(Gauge::Folders)?;
        let files = gauge(Gauge::Files)?;
        let size = gauge(Gauge::Size)?;

        let walk_duration = Histogram::with_opts(
            HistogramOpts::new(
                "maildir_walk_duration_seconds",
                "Duration of one maildir walk",
            )
            .buckets(WALK_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(walk_duration.clone()))?;

        Ok(Self {
            registry,
            elements,
            folders,
            files,
            size,
            walk_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MaildirError::Sink(e.to_string()))
    }

    fn vec(&self, gauge: Gauge) -> &GaugeVec {
        match gauge {
            Gauge::Elements => &self.elements,
            Gauge::Folders => &self.folders,
            Gauge::Files => &self.files,
            Gauge::Size => &self.size,
        }
    }
}

impl MetricSink for PrometheusSink {
    fn set_gauge(&self, gauge: Gauge, key: SeriesKey<'_>, value: f64) -> Result<()> {
        let values = gauge.label_values(&key)?;
        self.vec(gauge)
            .get_metric_with_label_values(&values)?
            .set(value);
        Ok(())
    }

    fn delete_series(&self, gauge: Gauge, key: SeriesKey<'_>) -> Result<bool> {
        let values = gauge.label_values(&key)?;
        // Cardinality is already checked, so an error here means "not found".
        Ok(self.vec(gauge).remove_label_values(&values).is_ok())
    }

    fn observe_walk_duration(&self, seconds: f64) {
        self.walk_duration.observe(seconds);
    }
}
