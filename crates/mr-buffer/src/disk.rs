//! Unbounded buffer persisted in a write-ahead log.
//!
//! Every added metric is written to the log and its accept hook runs once the
//! write succeeds. Batches read forward from the oldest record. Records that
//! the consumer resolves out of order are remembered in a mask of offsets
//! relative to the log head; once the mask covers a contiguous prefix starting
//! at the head, that prefix is truncated from the log and the mask re-based.
//!
//! The log cannot hold zero records, so when every record is resolved the
//! final one stays on disk, masked, and the buffer is flagged empty. The next
//! `add` deletes and recreates the file; `close` deletes it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mr_common::Metric;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::stats::BufferStats;
use crate::transaction::{Mark, Transaction};
use crate::wal::{Wal, WalOptions};

#[derive(Debug)]
struct DiskState {
    /// `None` once the buffer is closed.
    wal: Option<Wal>,
    path: PathBuf,
    options: WalOptions,
    /// Sorted offsets, relative to the log head, of resolved records.
    mask: Vec<u64>,
    /// Write index at open; tracked records below it come from an earlier process.
    original_end: u64,
    /// Only the already-resolved final record remains.
    is_empty: bool,
    in_transaction: bool,
}

impl DiskState {
    fn entries(&self) -> usize {
        match &self.wal {
            Some(wal) if wal.first_index() != 0 => {
                (wal.last_index() + 1 - wal.first_index()) as usize
            }
            _ => 0,
        }
    }

    fn len(&self) -> usize {
        if self.is_empty {
            return 0;
        }
        self.entries().saturating_sub(self.mask.len())
    }

    fn add_to_mask(&mut self, offsets: impl IntoIterator<Item = u64>) {
        self.mask.extend(offsets);
        self.mask.sort_unstable();
        self.mask.dedup();
    }

    /// Delete the log file and start over with an empty log.
    fn reset(&mut self) -> std::result::Result<(), crate::error::WalError> {
        self.wal = None;
        Wal::remove(&self.path)?;
        self.wal = Some(Wal::open(&self.path, self.options.clone())?);
        self.mask.clear();
        self.is_empty = false;
        self.original_end = 0;
        Ok(())
    }

    /// Truncate the contiguous resolved prefix at the head of the log.
    fn reclaim(&mut self) -> Result<()> {
        if self.mask.first() != Some(&0) {
            return Ok(());
        }
        let entries = self.entries() as u64;
        let prefix = self
            .mask
            .iter()
            .enumerate()
            .take_while(|(i, offset)| **offset == *i as u64)
            .count();
        let Some(wal) = self.wal.as_mut() else {
            return Ok(());
        };

        if prefix as u64 >= entries {
            let last = wal.last_index();
            wal.truncate_front(last)?;
            self.mask = vec![0];
            self.is_empty = true;
        } else {
            wal.truncate_front(wal.first_index() + prefix as u64)?;
            self.mask.drain(..prefix);
            for offset in &mut self.mask {
                *offset -= prefix as u64;
            }
        }
        Ok(())
    }
}

/// Disk-backed buffer over a single write-ahead log file.
#[derive(Debug)]
pub struct DiskBuffer {
    state: Mutex<DiskState>,
    stats: BufferStats,
}

impl DiskBuffer {
    /// Open or create the log at `path` with default options.
    pub fn new(path: impl Into<PathBuf>, stats: BufferStats) -> Result<Self> {
        Self::with_options(path, WalOptions::default(), stats)
    }

    pub fn with_options(
        path: impl Into<PathBuf>,
        options: WalOptions,
        stats: BufferStats,
    ) -> Result<Self> {
        let path = path.into();
        let wal = Wal::open(&path, options.clone())?;
        let original_end = wal.last_index() + 1;
        debug!(
            path = %path.display(),
            records = wal.len(),
            "opened disk buffer"
        );

        let state = DiskState {
            wal: Some(wal),
            path,
            options,
            mask: Vec::new(),
            original_end,
            is_empty: false,
            in_transaction: false,
        };
        stats.set_limit(0);
        stats.set_size(state.len());
        Ok(DiskBuffer {
            state: Mutex::new(state),
            stats,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Unresolved records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical records in the log, resolved or not.
    pub fn entries(&self) -> usize {
        self.lock().entries()
    }

    /// Resolved offsets not yet truncated, relative to the log head.
    pub fn mask(&self) -> Vec<u64> {
        self.lock().mask.clone()
    }

    /// First and last index of the log, 0 when it holds no records.
    pub fn index_range(&self) -> (u64, u64) {
        let state = self.lock();
        match &state.wal {
            Some(wal) => (wal.first_index(), wal.last_index()),
            None => (0, 0),
        }
    }

    /// Append metrics to the log. Returns the number that could not be stored.
    pub fn add(&self, metrics: Vec<Metric>) -> usize {
        let mut state = self.lock();
        let mut dropped = 0;
        for metric in metrics {
            if state.is_empty && state.wal.is_some() {
                if let Err(err) = state.reset() {
                    error!(path = %state.path.display(), error = %err, "failed to reset disk buffer");
                }
            }
            if !self.add_one(&mut state, metric) {
                dropped += 1;
            }
        }
        self.stats.set_size(state.len());
        dropped
    }

    fn add_one(&self, state: &mut DiskState, metric: Metric) -> bool {
        let Some(wal) = state.wal.as_mut() else {
            self.metric_dropped(metric);
            return false;
        };
        let data = match metric.to_bytes() {
            Ok(data) => data,
            Err(err) => {
                warn!(metric = metric.name(), error = %err, "failed to encode metric");
                self.metric_dropped(metric);
                return false;
            }
        };
        let index = wal.last_index() + 1;
        match wal.write(index, &data) {
            Ok(()) => {
                self.stats.added.inc();
                // Durability is the log's job from here on.
                metric.accept();
                true
            }
            Err(err) => {
                warn!(path = %state.path.display(), index, error = %err, "failed to write metric to disk buffer");
                self.metric_dropped(metric);
                false
            }
        }
    }

    /// Read up to `max` unresolved records from the head of the log.
    pub fn begin_transaction(&self, max: usize) -> Result<Transaction> {
        let mut state = self.lock();
        if state.in_transaction {
            warn!(path = %state.path.display(), "disk buffer transaction started while another is outstanding");
        }
        if max == 0 || state.is_empty {
            return Ok(Transaction::default());
        }

        let original_end = state.original_end;
        let mut batch = Vec::new();
        let mut offsets = Vec::new();
        let mut skipped = Vec::new();
        let mut orphaned = 0usize;
        {
            let DiskState { wal, mask, .. } = &mut *state;
            let Some(wal) = wal.as_mut() else {
                return Ok(Transaction::default());
            };
            let read_index = wal.first_index();
            if read_index == 0 {
                return Ok(Transaction::default());
            }
            let end = wal.last_index();

            let mut offset = 0u64;
            while batch.len() < max && read_index + offset <= end {
                if mask.binary_search(&offset).is_ok() {
                    offset += 1;
                    continue;
                }
                let index = read_index + offset;
                let data = wal.read(index)?;
                match Metric::from_bytes(&data) {
                    Ok(metric) if metric.tracking_id().is_some() && index < original_end => {
                        orphaned += 1;
                        skipped.push(offset);
                    }
                    Ok(metric) => {
                        batch.push(metric);
                        offsets.push(offset);
                    }
                    Err(err) => {
                        warn!(index, error = %err, "skipping undecodable record in disk buffer");
                        skipped.push(offset);
                    }
                }
                offset += 1;
            }
        }

        if !skipped.is_empty() {
            self.stats.dropped.inc_by(skipped.len() as u64);
            if orphaned > 0 {
                warn!(
                    count = orphaned,
                    "dropping metrics whose delivery tracking was lost on restart"
                );
            }
            state.add_to_mask(skipped);
            if batch.is_empty() {
                state.reclaim()?;
            }
            self.stats.set_size(state.len());
        }

        state.in_transaction = !batch.is_empty();
        Ok(Transaction::with_offsets(batch, offsets))
    }

    /// Resolve a transaction. Kept records stay where they are.
    pub fn end_transaction(&self, mut tx: Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        let offsets = std::mem::take(&mut tx.offsets);
        let mut resolved = Vec::new();
        for ((metric, mark), offset) in tx.into_marked().zip(offsets) {
            match mark {
                Mark::Accept => {
                    self.stats.written.inc();
                    metric.accept();
                    resolved.push(offset);
                }
                Mark::Reject => {
                    self.stats.rejected.inc();
                    metric.reject();
                    resolved.push(offset);
                }
                Mark::Keep => {}
            }
        }
        state.in_transaction = false;
        if state.wal.is_none() {
            return Ok(());
        }

        state.add_to_mask(resolved);
        state.reclaim()?;
        self.stats.set_size(state.len());
        Ok(())
    }

    /// Close the log. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(wal) = state.wal.take() {
            if state.is_empty {
                drop(wal);
                Wal::remove(&state.path)?;
            } else {
                wal.close()?;
            }
        }
        Ok(())
    }

    fn metric_dropped(&self, metric: Metric) {
        self.stats.dropped.inc();
        metric.reject();
    }
}

/// Path of the log file for an output `id` under `dir`.
pub fn log_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(id)
}
