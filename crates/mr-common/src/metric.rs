//! Metric model and binary codec.
//!
//! A [`Metric`] is a named set of tags and typed fields at a timestamp. It
//! may carry a delivery tracking handle; the disposition hooks
//! ([`Metric::accept`], [`Metric::reject`], [`Metric::discard`]) consume the
//! metric and resolve that handle.
//!
//! The byte encoding is used by the on-disk buffer only. It is a JSON
//! document; a tracked metric records its tracking id so a later process can
//! tell that the delivery notification for it can no longer be honoured.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tracking::{Disposition, TrackingHandle, TrackingId};

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}i", v),
            FieldValue::UInt(v) => write!(f, "{}u", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// Serialized form of a metric.
#[derive(Serialize, Deserialize)]
struct MetricRecord {
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracking_id: Option<TrackingId>,
}

/// A unit of telemetry.
#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    time: DateTime<Utc>,
    tracking: Option<TrackingHandle>,
    /// Tracking id restored from bytes; the group itself is gone.
    restored_tracking_id: Option<TrackingId>,
}

impl Metric {
    pub fn new(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Metric {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time,
            tracking: None,
            restored_tracking_id: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub(crate) fn with_tracking(mut self, handle: TrackingHandle) -> Self {
        self.tracking = Some(handle);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        self.tags.remove(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Whether a live tracking group is waiting on this metric.
    pub fn is_tracked(&self) -> bool {
        self.tracking.is_some()
    }

    /// Tracking id of the live group, or the id restored from bytes.
    pub fn tracking_id(&self) -> Option<TrackingId> {
        self.tracking
            .as_ref()
            .map(TrackingHandle::id)
            .or(self.restored_tracking_id)
    }

    /// Mark the metric as delivered.
    pub fn accept(self) {
        self.resolve(Disposition::Accepted);
    }

    /// Mark the metric as undeliverable.
    pub fn reject(self) {
        self.resolve(Disposition::Rejected);
    }

    /// Remove the metric without attempting delivery.
    pub fn discard(self) {
        self.resolve(Disposition::Dropped);
    }

    fn resolve(mut self, disposition: Disposition) {
        if let Some(handle) = self.tracking.take() {
            handle.resolve(disposition);
        }
    }

    /// Encode the metric for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = MetricRecord {
            name: self.name.clone(),
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            time: self.time,
            tracking_id: self.tracking_id(),
        };
        serde_json::to_vec(&record).map_err(|e| Error::Encode(e.to_string()))
    }

    /// Decode a metric previously produced by [`Metric::to_bytes`].
    ///
    /// The result never carries a live tracking handle.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let record: MetricRecord =
            serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))?;
        if record.name.is_empty() {
            return Err(Error::Decode("metric name is empty".to_string()));
        }
        Ok(Metric {
            name: record.name,
            tags: record.tags,
            fields: record.fields,
            time: record.time,
            tracking: None,
            restored_tracking_id: record.tracking_id,
        })
    }
}

/// Equality over the telemetry content; tracking state is ignored.
impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.time == other.time
            && self.tags == other.tags
            && self.fields == other.fields
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.tags {
            write!(f, ",{}={}", k, v)?;
        }
        let mut sep = ' ';
        for (k, v) in &self.fields {
            write!(f, "{}{}={}", sep, k, v)?;
            sep = ',';
        }
        let nanos = self
            .time
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.time.timestamp().saturating_mul(1_000_000_000));
        write!(f, " {}", nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Tracker;
    use chrono::TimeZone;

    fn sample() -> Metric {
        Metric::new("cpu", Utc.timestamp_opt(1_700_000_000, 5).unwrap())
            .with_tag("host", "a")
            .with_field("usage", 12.5)
            .with_field("cores", 8i64)
            .with_field("ok", true)
    }

    #[test]
    fn bytes_preserve_content() {
        let m = sample();
        let decoded = Metric::from_bytes(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.tracking_id(), None);
    }

    #[test]
    fn tracking_id_survives_encoding_but_group_does_not() {
        let tracker = Tracker::new();
        let m = tracker.track(sample());
        let bytes = m.to_bytes().unwrap();
        m.accept();

        let decoded = Metric::from_bytes(&bytes).unwrap();
        assert!(!decoded.is_tracked());
        assert_eq!(decoded.tracking_id(), Some(tracker.id()));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = Metric::from_bytes(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        let err = Metric::from_bytes(br#"{"name":"","fields":{},"time":"2024-01-01T00:00:00Z"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn display_is_line_protocol_like() {
        let m = Metric::new("mem", Utc.timestamp_opt(1, 0).unwrap())
            .with_tag("host", "h")
            .with_field("free", 3u64);
        assert_eq!(m.to_string(), "mem,host=h free=3u 1000000000");
    }
}
