//! Output-level statistics, registered next to the buffer statistics.
//!
//! ## Metrics
//!
//! **Counters** (labels `output`, `alias`):
//! - `mr_output_errors_total`: failed sink writes
//! - `mr_output_metrics_filtered_total`: metrics removed by name filters
//!
//! **Histograms** (labels `output`, `alias`):
//! - `mr_output_write_seconds`: duration of one sink write

use mr_buffer::{BufferStats, StatsRegistry};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

const LABELS: &[&str] = &["output", "alias"];

/// Every statistic the agent exports, on one Prometheus registry.
#[derive(Clone)]
pub struct AgentStats {
    buffers: StatsRegistry,
    errors: IntCounterVec,
    filtered: IntCounterVec,
    write_seconds: HistogramVec,
}

impl AgentStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let buffers = StatsRegistry::with_registry(registry.clone())?;

        let errors = IntCounterVec::new(
            Opts::new("mr_output_errors_total", "Failed sink writes"),
            LABELS,
        )?;
        registry.register(Box::new(errors.clone()))?;

        let filtered = IntCounterVec::new(
            Opts::new(
                "mr_output_metrics_filtered_total",
                "Metrics removed by output name filters",
            ),
            LABELS,
        )?;
        registry.register(Box::new(filtered.clone()))?;

        let write_seconds = HistogramVec::new(
            HistogramOpts::new("mr_output_write_seconds", "Sink write duration in seconds")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            LABELS,
        )?;
        registry.register(Box::new(write_seconds.clone()))?;

        Ok(AgentStats {
            buffers,
            errors,
            filtered,
            write_seconds,
        })
    }

    pub fn buffer_stats(&self, output: &str, alias: &str) -> BufferStats {
        self.buffers.buffer_stats(output, alias)
    }

    pub fn output_stats(&self, output: &str, alias: &str) -> OutputStats {
        let labels = [output, alias];
        OutputStats {
            errors: self.errors.with_label_values(&labels),
            filtered: self.filtered.with_label_values(&labels),
            write_seconds: self.write_seconds.with_label_values(&labels),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.buffers.registry()
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.buffers.render()
    }
}

/// Statistics for one running output.
#[derive(Clone, Debug)]
pub struct OutputStats {
    pub errors: IntCounter,
    pub filtered: IntCounter,
    pub write_seconds: Histogram,
}

impl OutputStats {
    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn metrics_filtered(&self) -> u64 {
        self.filtered.get()
    }

    pub fn writes_timed(&self) -> u64 {
        self.write_seconds.get_sample_count()
    }
}
