//! Output plumbing: sinks, name filters, statistics, and the running output
//! that ties a sink to its buffer.

pub mod filter;
pub mod running;
pub mod sink;
pub mod stats;

pub use filter::Filter;
pub use running::{OutputError, RunningOutput};
pub use sink::{build_sink, DiscardSink, FileSink, Sink, SinkError, WriterSink};
pub use stats::{AgentStats, OutputStats};
