//! Metrics relay agent library.
//!
//! Wires buffers from `mr-buffer` to sinks:
//! - `output`: sinks, name filters, statistics, and the running output
//! - `agent`: fan-out and per-output flush threads
//! - `logging`: tracing subscriber setup
//! - `exit_codes`: process exit codes for the CLI

pub mod agent;
pub mod exit_codes;
pub mod logging;
pub mod output;
pub mod synthetic;

pub use agent::{Agent, AgentError, OutputSummary};
pub use exit_codes::ExitCode;
