//! Buffer self-statistics exported through Prometheus.
//!
//! ## Metrics
//!
//! **Counters** (labels `output`, `alias`):
//! - `mr_metrics_added_total`: metrics stored in a buffer
//! - `mr_metrics_written_total`: metrics accepted by the sink
//! - `mr_metrics_dropped_total`: metrics evicted or unrecoverable
//! - `mr_metrics_rejected_total`: metrics the sink refused permanently
//!
//! **Gauges** (labels `output`, `alias`):
//! - `mr_buffer_size`: current buffer occupancy
//! - `mr_buffer_limit`: configured capacity (0 for unbounded)
//!
//! A [`StatsRegistry`] is created once per process and injected into every
//! buffer; each buffer holds a [`BufferStats`] bound to its own labels.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

const LABELS: &[&str] = &["output", "alias"];

/// Process-wide registry of buffer statistics.
///
/// All metric updates are thread-safe via atomic operations in the prometheus crate.
#[derive(Clone)]
pub struct StatsRegistry {
    registry: Registry,
    added: IntCounterVec,
    written: IntCounterVec,
    dropped: IntCounterVec,
    rejected: IntCounterVec,
    size: IntGaugeVec,
    limit: IntGaugeVec,
}

impl StatsRegistry {
    /// Create a registry and register all buffer metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Register buffer metrics on an existing Prometheus registry.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let added = IntCounterVec::new(
            Opts::new("mr_metrics_added_total", "Metrics stored in the buffer"),
            LABELS,
        )?;
        registry.register(Box::new(added.clone()))?;

        let written = IntCounterVec::new(
            Opts::new("mr_metrics_written_total", "Metrics accepted by the sink"),
            LABELS,
        )?;
        registry.register(Box::new(written.clone()))?;

        let dropped = IntCounterVec::new(
            Opts::new(
                "mr_metrics_dropped_total",
                "Metrics evicted from the buffer or unrecoverable from disk",
            ),
            LABELS,
        )?;
        registry.register(Box::new(dropped.clone()))?;

        let rejected = IntCounterVec::new(
            Opts::new(
                "mr_metrics_rejected_total",
                "Metrics permanently refused by the sink",
            ),
            LABELS,
        )?;
        registry.register(Box::new(rejected.clone()))?;

        let size = IntGaugeVec::new(
            Opts::new("mr_buffer_size", "Current number of metrics in the buffer"),
            LABELS,
        )?;
        registry.register(Box::new(size.clone()))?;

        let limit = IntGaugeVec::new(
            Opts::new("mr_buffer_limit", "Buffer capacity, 0 when unbounded"),
            LABELS,
        )?;
        registry.register(Box::new(limit.clone()))?;

        Ok(StatsRegistry {
            registry,
            added,
            written,
            dropped,
            rejected,
            size,
            limit,
        })
    }

    /// Statistics handle for one buffer.
    pub fn buffer_stats(&self, output: &str, alias: &str) -> BufferStats {
        let labels = [output, alias];
        BufferStats {
            added: self.added.with_label_values(&labels),
            written: self.written.with_label_values(&labels),
            dropped: self.dropped.with_label_values(&labels),
            rejected: self.rejected.with_label_values(&labels),
            size: self.size.with_label_values(&labels),
            limit: self.limit.with_label_values(&labels),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all registered metrics in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Counters and gauges for a single buffer.
#[derive(Clone, Debug)]
pub struct BufferStats {
    pub added: IntCounter,
    pub written: IntCounter,
    pub dropped: IntCounter,
    pub rejected: IntCounter,
    pub size: IntGauge,
    pub limit: IntGauge,
}

impl BufferStats {
    /// Handles not attached to any registry.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Ok(BufferStats {
            added: IntCounter::new("mr_metrics_added_total", "added")?,
            written: IntCounter::new("mr_metrics_written_total", "written")?,
            dropped: IntCounter::new("mr_metrics_dropped_total", "dropped")?,
            rejected: IntCounter::new("mr_metrics_rejected_total", "rejected")?,
            size: IntGauge::new("mr_buffer_size", "size")?,
            limit: IntGauge::new("mr_buffer_limit", "limit")?,
        })
    }

    pub fn metrics_added(&self) -> u64 {
        self.added.get()
    }

    pub fn metrics_written(&self) -> u64 {
        self.written.get()
    }

    pub fn metrics_dropped(&self) -> u64 {
        self.dropped.get()
    }

    pub fn metrics_rejected(&self) -> u64 {
        self.rejected.get()
    }

    pub fn buffer_size(&self) -> i64 {
        self.size.get()
    }

    pub fn buffer_limit(&self) -> i64 {
        self.limit.get()
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.limit.set(i64::try_from(limit).unwrap_or(i64::MAX));
    }
}
