//! The agent: fans metrics out to every output and runs one flush thread per
//! output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mr_common::{AgentConfig, Metric, OutputConfig};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::output::{build_sink, AgentStats, OutputError, RunningOutput, Sink};

/// Upper bound on how long a flush thread sleeps before rechecking shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] mr_common::Error),

    #[error("{output}: {source}")]
    Output {
        output: String,
        #[source]
        source: OutputError,
    },

    #[error("stats registration failed: {0}")]
    Stats(#[from] prometheus::Error),

    #[error("failed to spawn flush thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl AgentError {
    fn output(output: &RunningOutput, source: OutputError) -> Self {
        AgentError::Output {
            output: output.log_name().to_string(),
            source,
        }
    }
}

/// Delivery totals for one output, read after shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
    pub output: String,
    pub added: u64,
    pub written: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub filtered: u64,
    pub errors: u64,
    pub remaining: usize,
    /// The flush thread stopped because the disk buffer is corrupt.
    pub storage_failed: bool,
}

impl OutputSummary {
    /// True when something was lost or is still waiting for delivery.
    pub fn has_undelivered(&self) -> bool {
        self.dropped > 0 || self.rejected > 0 || self.remaining > 0
    }
}

pub struct Agent {
    outputs: Vec<Arc<RunningOutput>>,
    stats: AgentStats,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<bool>>,
}

impl Agent {
    /// Build every configured output and its sink.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let stats = AgentStats::new()?;
        let mut outputs = Vec::new();
        for output_config in config.output_configs() {
            let name = output_config.log_name();
            let sink = build_sink(&output_config).map_err(|e| AgentError::Output {
                output: name,
                source: e.into(),
            })?;
            outputs.push((output_config, sink));
        }
        Self::with_sinks(outputs, stats)
    }

    /// Build an agent from explicit sinks.
    pub fn with_sinks(
        outputs: Vec<(OutputConfig, Box<dyn Sink>)>,
        stats: AgentStats,
    ) -> Result<Self, AgentError> {
        let mut running = Vec::with_capacity(outputs.len());
        for (config, sink) in outputs {
            let name = config.log_name();
            let output = RunningOutput::new(config, sink, &stats).map_err(|source| {
                AgentError::Output {
                    output: name,
                    source,
                }
            })?;
            running.push(Arc::new(output));
        }
        Ok(Agent {
            outputs: running,
            stats,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    pub fn outputs(&self) -> &[Arc<RunningOutput>] {
        &self.outputs
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    /// Connect all outputs and start their flush threads.
    ///
    /// Outputs configured to ignore startup failures are removed when they
    /// cannot connect.
    pub fn start(&mut self) -> Result<(), AgentError> {
        let mut connected = Vec::with_capacity(self.outputs.len());
        for output in self.outputs.drain(..) {
            match output.connect() {
                Ok(()) => connected.push(output),
                Err(OutputError::Fatal(err)) => {
                    warn!(output = %output.log_name(), error = %err, "output disabled after startup failure");
                    if let Err(err) = output.buffer().close() {
                        warn!(output = %output.log_name(), error = %err, "closing buffer failed");
                    }
                }
                Err(err) => return Err(AgentError::output(&output, err)),
            }
        }
        self.outputs = connected;

        for output in &self.outputs {
            let output = Arc::clone(output);
            let shutdown = Arc::clone(&self.shutdown);
            let handle = thread::Builder::new()
                .name(format!("flush-{}", output.config().id))
                .spawn(move || flush_loop(&output, &shutdown))?;
            self.workers.push(handle);
        }
        info!(outputs = self.outputs.len(), "agent started");
        Ok(())
    }

    /// Deliver a metric to every output. All but the last receive a copy.
    pub fn add_metric(&self, metric: Metric) {
        let Some((last, rest)) = self.outputs.split_last() else {
            metric.discard();
            return;
        };
        for output in rest {
            output.add_metric(metric.clone());
        }
        last.add_metric(metric);
    }

    /// Stop the flush threads, flush what is left, and close every output.
    pub fn stop(mut self) -> Vec<OutputSummary> {
        self.shutdown.store(true, Ordering::SeqCst);
        let failed: Vec<bool> = self
            .workers
            .drain(..)
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    warn!("flush thread panicked");
                    false
                })
            })
            .collect();

        let mut summaries = Vec::with_capacity(self.outputs.len());
        for (i, output) in self.outputs.iter().enumerate() {
            let storage_failed = failed.get(i).copied().unwrap_or(false);
            if let Err(err) = output.close() {
                warn!(output = %output.log_name(), error = %err, "closing output failed");
            }
            let buffer = output.buffer().stats();
            summaries.push(OutputSummary {
                output: output.log_name().to_string(),
                added: buffer.metrics_added(),
                written: buffer.metrics_written(),
                dropped: buffer.metrics_dropped(),
                rejected: buffer.metrics_rejected(),
                filtered: output.stats().metrics_filtered(),
                errors: output.stats().errors(),
                remaining: output.remaining(),
                storage_failed,
            });
        }
        info!("agent stopped");
        summaries
    }
}

/// Write on every flush interval, and a single batch whenever one fills up.
///
/// Returns true when the loop gave up on a corrupt disk buffer.
fn flush_loop(output: &RunningOutput, shutdown: &AtomicBool) -> bool {
    let interval = output.config().flush_interval;
    let mut next_flush = Instant::now() + interval;

    while !shutdown.load(Ordering::SeqCst) {
        let wait = next_flush
            .saturating_duration_since(Instant::now())
            .min(SHUTDOWN_POLL);
        if output.wait_batch_ready(wait) {
            if let Err(err) = output.write_batch() {
                if err.is_storage_fault() {
                    error!(output = %output.log_name(), error = %err, "disk buffer is corrupt, output stopped");
                    return true;
                }
                debug!(output = %output.log_name(), error = %err, "batch write failed");
            }
            continue;
        }
        if Instant::now() >= next_flush {
            if let Err(err) = output.write() {
                if err.is_storage_fault() {
                    error!(output = %output.log_name(), error = %err, "disk buffer is corrupt, output stopped");
                    return true;
                }
                warn!(output = %output.log_name(), error = %err, "error writing to output");
            }
            output.log_buffer_status();
            next_flush = Instant::now() + interval;
        }
    }
    false
}
