//! Metrics relay common types, tracking, and errors.
//!
//! This crate provides foundational types shared by the buffer and agent crates:
//! - The `Metric` model and its binary codec
//! - Delivery tracking groups with per-metric disposition hooks
//! - Common error types
//! - Agent configuration loading and validation

pub mod config;
pub mod error;
pub mod metric;
pub mod tracking;

pub use config::{
    AgentConfig, BufferStrategy, ConfigPaths, ConfigResolver, ConfigSource, OutputConfig,
    StartupErrorBehavior,
};
pub use error::{Error, Result};
pub use metric::{FieldValue, Metric};
pub use tracking::{DeliveryInfo, Disposition, TrackingId, Tracker};
