//! Backend-independent buffer handle.

use std::path::Path;

use mr_common::{BufferStrategy, Metric};

use crate::disk::{log_path, DiskBuffer};
use crate::error::{BufferError, Result};
use crate::memory::MemoryBuffer;
use crate::stats::BufferStats;
use crate::transaction::Transaction;
use crate::wal::WalOptions;

/// Storage backend chosen when the buffer is created.
#[derive(Debug)]
pub enum Backend {
    Memory(MemoryBuffer),
    Disk(DiskBuffer),
}

/// A metric buffer for one output.
#[derive(Debug)]
pub struct Buffer {
    name: String,
    alias: String,
    backend: Backend,
}

impl Buffer {
    /// Create a buffer.
    ///
    /// `capacity` bounds the memory backend; the disk backend is unbounded and
    /// stores its log at `directory/name`.
    pub fn new(
        name: &str,
        alias: &str,
        capacity: usize,
        strategy: BufferStrategy,
        directory: Option<&Path>,
        stats: BufferStats,
    ) -> Result<Self> {
        Self::with_wal_options(
            name,
            alias,
            capacity,
            strategy,
            directory,
            WalOptions::default(),
            stats,
        )
    }

    pub fn with_wal_options(
        name: &str,
        alias: &str,
        capacity: usize,
        strategy: BufferStrategy,
        directory: Option<&Path>,
        wal_options: WalOptions,
        stats: BufferStats,
    ) -> Result<Self> {
        let backend = match strategy {
            BufferStrategy::Memory => Backend::Memory(MemoryBuffer::new(capacity, stats)?),
            BufferStrategy::Disk => {
                let dir = directory.ok_or_else(|| BufferError::MissingDirectory(name.to_string()))?;
                Backend::Disk(DiskBuffer::with_options(
                    log_path(dir, name),
                    wal_options,
                    stats,
                )?)
            }
        };
        Ok(Buffer {
            name: name.to_string(),
            alias: alias.to_string(),
            backend,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn kind(&self) -> BufferStrategy {
        match self.backend {
            Backend::Memory(_) => BufferStrategy::Memory,
            Backend::Disk(_) => BufferStrategy::Disk,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn stats(&self) -> &BufferStats {
        match &self.backend {
            Backend::Memory(b) => b.stats(),
            Backend::Disk(b) => b.stats(),
        }
    }

    /// Metrics currently held, including an outstanding batch.
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Memory(b) => b.len(),
            Backend::Disk(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store metrics. Returns how many metrics were dropped.
    pub fn add(&self, metrics: Vec<Metric>) -> usize {
        match &self.backend {
            Backend::Memory(b) => b.add(metrics),
            Backend::Disk(b) => b.add(metrics),
        }
    }

    /// Hand out up to `max` of the oldest unresolved metrics.
    pub fn begin_transaction(&self, max: usize) -> Result<Transaction> {
        match &self.backend {
            Backend::Memory(b) => Ok(b.begin_transaction(max)),
            Backend::Disk(b) => b.begin_transaction(max),
        }
    }

    /// Resolve a transaction returned by [`Buffer::begin_transaction`].
    pub fn end_transaction(&self, tx: Transaction) -> Result<()> {
        match &self.backend {
            Backend::Memory(b) => {
                b.end_transaction(tx);
                Ok(())
            }
            Backend::Disk(b) => b.end_transaction(tx),
        }
    }

    /// Release backend resources. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        match &self.backend {
            Backend::Memory(_) => Ok(()),
            Backend::Disk(b) => b.close(),
        }
    }
}
