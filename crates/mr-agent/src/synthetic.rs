//! Synthetic metric generator used by `mr-agent run`.

use chrono::{DateTime, Utc};
use mr_common::Metric;

const NAMES: [&str; 4] = ["cpu", "mem", "disk", "net"];

/// Produces an endless, deterministic stream of metrics.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    host: String,
    seq: u64,
}

impl SyntheticSource {
    pub fn new(host: impl Into<String>) -> Self {
        SyntheticSource {
            host: host.into(),
            seq: 0,
        }
    }

    /// Number of metrics produced so far.
    pub fn produced(&self) -> u64 {
        self.seq
    }

    pub fn next_metric(&mut self, time: DateTime<Utc>) -> Metric {
        let seq = self.seq;
        self.seq += 1;
        let name = NAMES[(seq % NAMES.len() as u64) as usize];
        Metric::new(name, time)
            .with_tag("host", self.host.as_str())
            .with_field("seq", seq)
            .with_field("value", (seq % 100) as f64 / 100.0)
    }
}
