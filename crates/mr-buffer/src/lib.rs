//! Metrics relay buffering.
//!
//! This crate holds metrics between collection and delivery:
//! - `MemoryBuffer`: fixed-capacity ring that evicts the oldest metric when full
//! - `DiskBuffer`: unbounded buffer persisted in a write-ahead log
//! - `Transaction`: the batch handed to a consumer and its per-position outcome
//! - `StatsRegistry` / `BufferStats`: Prometheus counters updated by every buffer
//!
//! Both backends implement the same contract and are selected once through
//! [`Buffer::new`]. Every operation on one buffer is serialized by a single lock.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod memory;
pub mod stats;
pub mod transaction;
pub mod wal;

pub use buffer::{Backend, Buffer};
pub use disk::DiskBuffer;
pub use error::{BufferError, Result, WalError};
pub use memory::MemoryBuffer;
pub use stats::{BufferStats, StatsRegistry};
pub use transaction::{Mark, Transaction};
pub use wal::{Wal, WalOptions};
