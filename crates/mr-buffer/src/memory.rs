//! Fixed-capacity in-memory ring buffer.
//!
//! When the ring is full, adding a metric evicts the oldest resident metric.
//! A batch handed out by `begin_transaction` leaves the ring but still counts
//! against the capacity until the transaction ends; evictions that happen
//! while it is outstanding shrink that reservation instead. Kept metrics are
//! put back in front of the oldest resident metric as far as free slots allow,
//! dropping the oldest kept metrics first.

use std::sync::{Mutex, PoisonError};

use mr_common::Metric;
use tracing::warn;

use crate::error::{BufferError, Result};
use crate::stats::BufferStats;
use crate::transaction::{Mark, Transaction};

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Metric>>,
    /// Slot of the oldest resident metric.
    first: usize,
    /// Slot the next metric is written to.
    last: usize,
    /// Resident metrics.
    size: usize,
    /// Outstanding batch positions still reserved against the capacity.
    batch_size: usize,
    in_transaction: bool,
}

impl Ring {
    fn cap(&self) -> usize {
        self.slots.len()
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.cap()
    }

    fn prev_by(&self, index: usize, count: usize) -> usize {
        (index + self.cap() - count % self.cap()) % self.cap()
    }

    fn len(&self) -> usize {
        (self.size + self.batch_size).min(self.cap())
    }
}

/// In-memory ring buffer of at most `capacity` metrics.
#[derive(Debug)]
pub struct MemoryBuffer {
    ring: Mutex<Ring>,
    stats: BufferStats,
}

impl MemoryBuffer {
    pub fn new(capacity: usize, stats: BufferStats) -> Result<Self> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        stats.set_limit(capacity);
        stats.set_size(0);
        Ok(MemoryBuffer {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                first: 0,
                last: 0,
                size: 0,
                batch_size: 0,
                in_transaction: false,
            }),
            stats,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap()
    }

    /// Resident plus outstanding metrics, capped at the capacity.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Store metrics, evicting the oldest ones if the ring is full.
    ///
    /// Returns the number of metrics evicted.
    pub fn add(&self, metrics: Vec<Metric>) -> usize {
        let mut ring = self.lock();
        let mut dropped = 0;
        for metric in metrics {
            dropped += self.add_one(&mut ring, metric);
        }
        self.stats.set_size(ring.len());
        dropped
    }

    fn add_one(&self, ring: &mut Ring, metric: Metric) -> usize {
        let mut dropped = 0;
        if ring.size == ring.cap() {
            let slot = ring.last;
            if let Some(evicted) = ring.slots[slot].take() {
                self.metric_dropped(evicted);
            }
            dropped = 1;
            if ring.batch_size > 0 {
                ring.batch_size -= 1;
            }
        }

        self.stats.added.inc();
        let slot = ring.last;
        ring.slots[slot] = Some(metric);
        ring.last = ring.next(slot);
        if dropped != 0 {
            ring.first = ring.next(ring.first);
        }
        ring.size = (ring.size + 1).min(ring.cap());
        dropped
    }

    /// Take up to `max` of the oldest resident metrics.
    pub fn begin_transaction(&self, max: usize) -> Transaction {
        let mut ring = self.lock();
        if ring.in_transaction {
            warn!("memory buffer transaction started while another is outstanding");
        }

        let out = ring.size.min(max);
        let mut batch = Vec::with_capacity(out);
        let mut slot = ring.first;
        for _ in 0..out {
            if let Some(metric) = ring.slots[slot].take() {
                batch.push(metric);
            }
            slot = ring.next(slot);
        }
        ring.first = slot;
        ring.size -= out;
        ring.batch_size = out;
        ring.in_transaction = out > 0;
        Transaction::new(batch)
    }

    /// Resolve a transaction previously returned by `begin_transaction`.
    pub fn end_transaction(&self, tx: Transaction) {
        let mut ring = self.lock();

        let mut keep = Vec::new();
        for (metric, mark) in tx.into_marked() {
            match mark {
                Mark::Accept => self.metric_written(metric),
                Mark::Reject => self.metric_rejected(metric),
                Mark::Keep => keep.push(metric),
            }
        }

        if !keep.is_empty() {
            let free = ring.cap() - ring.size;
            let restore = keep.len().min(free);
            // Newest data wins: the oldest kept metrics give way.
            let retained = keep.split_off(keep.len() - restore);
            for metric in keep {
                self.metric_dropped(metric);
            }

            ring.first = ring.prev_by(ring.first, restore);
            ring.size = (ring.size + restore).min(ring.cap());
            let mut slot = ring.first;
            for metric in retained {
                ring.slots[slot] = Some(metric);
                slot = ring.next(slot);
            }
        }

        ring.batch_size = 0;
        ring.in_transaction = false;
        self.stats.set_size(ring.len());
    }

    fn metric_written(&self, metric: Metric) {
        self.stats.written.inc();
        metric.accept();
    }

    fn metric_rejected(&self, metric: Metric) {
        self.stats.rejected.inc();
        metric.reject();
    }

    fn metric_dropped(&self, metric: Metric) {
        self.stats.dropped.inc();
        metric.reject();
    }
}
