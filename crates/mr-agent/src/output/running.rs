//! A configured output: name filtering, its buffer, and batched sink writes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mr_buffer::{Buffer, BufferError};
use mr_common::{BufferStrategy, Metric, OutputConfig, StartupErrorBehavior};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use super::filter::Filter;
use super::sink::{Sink, SinkError};
use super::stats::{AgentStats, OutputStats};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("invalid name filter: {0}")]
    Filter(#[from] regex::Error),

    #[error("metric_batch_size must be greater than zero")]
    InvalidBatchSize,

    /// Startup failed and the output asked to be removed instead of retried.
    #[error("output disabled: {0}")]
    Fatal(SinkError),
}

impl OutputError {
    /// Root sink error, looking through partial writes.
    pub fn sink_error(&self) -> Option<&SinkError> {
        match self {
            OutputError::Sink(err) | OutputError::Fatal(err) => Some(err.root()),
            _ => None,
        }
    }

    /// True when the output's disk buffer can no longer be read.
    pub fn is_storage_fault(&self) -> bool {
        matches!(self, OutputError::Buffer(err) if err.is_corrupt())
    }
}

/// One output: filters and renames metrics, buffers them, and writes them to
/// its sink in batches.
///
/// Any number of threads may call [`RunningOutput::add_metric`]; writes are
/// serialized internally.
pub struct RunningOutput {
    config: OutputConfig,
    log_name: String,
    alias: String,
    sink: Mutex<Box<dyn Sink>>,
    buffer: Buffer,
    filter: Filter,
    stats: OutputStats,
    started: AtomicBool,
    new_metrics: AtomicUsize,
    dropped_since_log: AtomicU64,
    /// Buffer length after the final flush in `close`.
    remaining_at_close: Mutex<Option<usize>>,
    batch_ready_tx: SyncSender<()>,
    batch_ready_rx: Mutex<Receiver<()>>,
}

impl RunningOutput {
    pub fn new(
        config: OutputConfig,
        sink: Box<dyn Sink>,
        stats: &AgentStats,
    ) -> Result<Self, OutputError> {
        if config.metric_batch_size == 0 {
            return Err(OutputError::InvalidBatchSize);
        }
        let alias = config.alias.clone().unwrap_or_default();
        let buffer = Buffer::new(
            &config.id,
            &alias,
            config.metric_buffer_limit,
            config.buffer_strategy,
            config.buffer_directory.as_deref(),
            stats.buffer_stats(&config.name, &alias),
        )?;
        let filter = Filter::new(&config.namepass, &config.namedrop)?;
        let (batch_ready_tx, batch_ready_rx) = mpsc::sync_channel(1);

        Ok(RunningOutput {
            log_name: config.log_name(),
            stats: stats.output_stats(&config.name, &alias),
            alias,
            config,
            sink: Mutex::new(sink),
            buffer,
            filter,
            started: AtomicBool::new(false),
            new_metrics: AtomicUsize::new(0),
            dropped_since_log: AtomicU64::new(0),
            remaining_at_close: Mutex::new(None),
            batch_ready_tx,
            batch_ready_rx: Mutex::new(batch_ready_rx),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn stats(&self) -> &OutputStats {
        &self.stats
    }

    /// Metrics still waiting for delivery. After `close` this is the count
    /// left behind by the final flush, since a closed disk buffer reports 0.
    pub fn remaining(&self) -> usize {
        let closed = *self
            .remaining_at_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        closed.unwrap_or_else(|| self.buffer.len())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn lock_sink(&self) -> MutexGuard<'_, Box<dyn Sink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect the sink, applying the configured startup error behavior.
    pub fn connect(&self) -> Result<(), OutputError> {
        let mut sink = self.lock_sink();
        match sink.connect() {
            Ok(()) => {
                self.started.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err @ SinkError::Startup { retry: true, .. }) => {
                match self.config.startup_error_behavior {
                    StartupErrorBehavior::Error => Err(err.into()),
                    StartupErrorBehavior::Retry => {
                        warn!(output = %self.log_name, error = %err, "connect failed; retrying before each write");
                        Ok(())
                    }
                    StartupErrorBehavior::Ignore => Err(OutputError::Fatal(err)),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reconnect a sink that has not started yet. A partially started sink
    /// may be written to in the meantime.
    fn ensure_connected(&self, sink: &mut dyn Sink) -> Result<(), OutputError> {
        if self.is_started() {
            return Ok(());
        }
        match sink.connect() {
            Ok(()) => {
                self.started.store(true, Ordering::SeqCst);
                info!(output = %self.log_name, "connected");
                Ok(())
            }
            Err(SinkError::Startup { partial: true, .. }) => Ok(()),
            Err(err) => {
                debug!(output = %self.log_name, error = %err, "reconnect failed");
                Err(SinkError::NotConnected.into())
            }
        }
    }

    /// Filter, rename, and buffer one metric.
    pub fn add_metric(&self, metric: Metric) {
        if !self.filter.should_name_pass(metric.name()) {
            self.stats.filtered.inc();
            metric.discard();
            return;
        }
        let metric = self.rename(metric);

        let dropped = self.buffer.add(vec![metric]);
        if dropped > 0 {
            self.dropped_since_log
                .fetch_add(dropped as u64, Ordering::SeqCst);
        }

        let count = self.new_metrics.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.config.metric_batch_size {
            self.new_metrics.store(0, Ordering::SeqCst);
            self.signal_batch_ready();
        }
    }

    fn rename(&self, mut metric: Metric) -> Metric {
        if let Some(name) = &self.config.name_override {
            metric.set_name(name.clone());
        }
        if let Some(prefix) = &self.config.name_prefix {
            let name = format!("{}{}", prefix, metric.name());
            metric.set_name(name);
        }
        if let Some(suffix) = &self.config.name_suffix {
            let name = format!("{}{}", metric.name(), suffix);
            metric.set_name(name);
        }
        metric
    }

    fn signal_batch_ready(&self) {
        // Full means a signal is already pending.
        let _ = self.batch_ready_tx.try_send(());
    }

    /// Wait up to `timeout` for a full batch to become available.
    pub fn wait_batch_ready(&self, timeout: Duration) -> bool {
        let rx = self
            .batch_ready_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Take a pending batch-ready signal without waiting.
    pub fn take_batch_ready(&self) -> bool {
        let rx = self
            .batch_ready_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        rx.try_recv().is_ok()
    }

    /// Write everything buffered when the call starts, batch by batch.
    ///
    /// Metrics added while writing are left for the next call. Stops at the
    /// first failed batch and returns its error.
    pub fn write(&self) -> Result<(), OutputError> {
        let span = info_span!("write", output = %self.config.name, alias = %self.alias);
        let _enter = span.enter();

        let mut sink = self.lock_sink();
        self.ensure_connected(sink.as_mut())?;
        self.new_metrics.store(0, Ordering::SeqCst);
        self.log_dropped();

        let batch_size = self.config.metric_batch_size;
        let batches = self.buffer.len() / batch_size + 1;
        for _ in 0..batches {
            if !self.write_one(sink.as_mut(), batch_size)? {
                break;
            }
        }
        Ok(())
    }

    /// Write a single batch.
    pub fn write_batch(&self) -> Result<(), OutputError> {
        let span = info_span!("write", output = %self.config.name, alias = %self.alias);
        let _enter = span.enter();

        let mut sink = self.lock_sink();
        self.ensure_connected(sink.as_mut())?;
        self.log_dropped();
        self.write_one(sink.as_mut(), self.config.metric_batch_size)?;
        Ok(())
    }

    /// Returns `Ok(false)` once the buffer has nothing left to hand out.
    fn write_one(&self, sink: &mut dyn Sink, batch_size: usize) -> Result<bool, OutputError> {
        let mut tx = self.buffer.begin_transaction(batch_size)?;
        if tx.is_empty() {
            self.buffer.end_transaction(tx)?;
            return Ok(false);
        }

        let start = Instant::now();
        let result = sink.write(tx.batch());
        let elapsed = start.elapsed();
        self.stats.write_seconds.observe(elapsed.as_secs_f64());

        match &result {
            Ok(()) => tx.accept_all(),
            Err(SinkError::Partial {
                accepted, rejected, ..
            }) => {
                for &i in accepted {
                    tx.accept(i);
                }
                for &i in rejected {
                    tx.reject(i);
                }
            }
            Err(_) => tx.keep_all(),
        }
        let count = tx.len();
        let resolved = tx.accepted().len() + tx.rejected().len();
        self.buffer.end_transaction(tx)?;

        match result {
            Ok(()) => {
                debug!(
                    count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "wrote batch"
                );
                Ok(true)
            }
            Err(err) => {
                self.stats.errors.inc();
                // Progress was made, so the sink is alive; pick up the rest
                // without waiting for the flush interval.
                if resolved > 0 && self.buffer.len() >= batch_size {
                    self.signal_batch_ready();
                }
                Err(err.into())
            }
        }
    }

    fn log_dropped(&self) {
        let dropped = self.dropped_since_log.swap(0, Ordering::SeqCst);
        if dropped > 0 {
            warn!(
                output = %self.log_name,
                dropped,
                "metric buffer overflow; metrics have been dropped"
            );
        }
    }

    /// Warn about drops since the last report and log how full the buffer is.
    pub fn log_buffer_status(&self) {
        self.log_dropped();
        let len = self.buffer.len();
        match self.config.buffer_strategy {
            BufferStrategy::Disk => {
                debug!(output = %self.log_name, metrics = len, "buffer fullness")
            }
            BufferStrategy::Memory => debug!(
                output = %self.log_name,
                metrics = len,
                limit = self.config.metric_buffer_limit,
                "buffer fullness"
            ),
        }
    }

    /// Final flush, then release the sink and the buffer.
    pub fn close(&self) -> Result<(), OutputError> {
        if let Err(err) = self.write() {
            warn!(output = %self.log_name, error = %err, "final write failed");
        }
        let close_result = self.lock_sink().close();
        *self
            .remaining_at_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(self.buffer.len());
        self.buffer.close()?;
        close_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::sink::DiscardSink;
    use chrono::{TimeZone, Utc};

    fn metric(name: &str) -> Metric {
        Metric::new(name, Utc.timestamp_opt(101, 0).unwrap()).with_field("value", 101.0)
    }

    fn output(config: OutputConfig) -> RunningOutput {
        RunningOutput::new(config, Box::new(DiscardSink), &AgentStats::new().unwrap()).unwrap()
    }

    #[test]
    fn batch_ready_signals_every_batch_size_metrics() {
        let ro = output(OutputConfig::new("discard").with_batch_size(3));
        ro.add_metric(metric("a"));
        ro.add_metric(metric("b"));
        assert!(!ro.take_batch_ready());
        ro.add_metric(metric("c"));
        assert!(ro.take_batch_ready());
        assert!(!ro.take_batch_ready());
    }

    #[test]
    fn filtered_metrics_are_counted() {
        let mut config = OutputConfig::new("discard");
        config.namedrop = vec!["internal_*".to_string()];
        let ro = output(config);
        ro.add_metric(metric("internal_gc"));
        ro.add_metric(metric("cpu"));
        assert_eq!(ro.stats().metrics_filtered(), 1);
        assert_eq!(ro.buffer().len(), 1);
    }

    #[test]
    fn invalid_buffer_limit_is_an_error() {
        let config = OutputConfig::new("discard").with_buffer_limit(0);
        let err = RunningOutput::new(config, Box::new(DiscardSink), &AgentStats::new().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, OutputError::Buffer(BufferError::InvalidCapacity(0))));
        assert!(!err.is_storage_fault());
    }

    #[test]
    fn zero_batch_size_is_an_error() {
        let config = OutputConfig::new("discard").with_batch_size(0);
        let err = RunningOutput::new(config, Box::new(DiscardSink), &AgentStats::new().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, OutputError::InvalidBatchSize));
    }

    #[test]
    fn corrupt_buffer_is_a_storage_fault() {
        let err = OutputError::Buffer(BufferError::from(mr_buffer::WalError::Corrupt {
            path: "log".into(),
            offset: 0,
            reason: "bad checksum".to_string(),
        }));
        assert!(err.is_storage_fault());
        assert!(!OutputError::Sink(SinkError::NotConnected).is_storage_fault());
    }

    #[test]
    fn write_times_each_batch() {
        let ro = output(OutputConfig::new("discard").with_batch_size(2));
        for name in ["a", "b", "c"] {
            ro.add_metric(metric(name));
        }
        ro.write().unwrap();
        assert_eq!(ro.stats().writes_timed(), 2);
        assert!(ro.buffer().is_empty());
    }
}
