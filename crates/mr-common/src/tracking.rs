//! Delivery tracking for metrics.
//!
//! A [`Tracker`] owns a tracking group. Every metric attached to the group
//! through [`Tracker::track`] carries a [`TrackingHandle`] that must be
//! resolved exactly once by one of the metric's disposition hooks
//! (`accept`, `reject`, `discard`). A handle that is dropped without being
//! resolved counts as dropped, so a tracked metric is never lost silently.
//!
//! When the last pending metric of a group is resolved the group's notify
//! callback receives a [`DeliveryInfo`] summary. The callback fires at most
//! once; metrics tracked after the group completed only update its counters.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metric::Metric;

/// Identifier of a tracking group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(pub Uuid);

impl TrackingId {
    /// Generate a fresh random tracking id.
    pub fn new() -> Self {
        TrackingId(Uuid::new_v4())
    }
}

impl Default for TrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of a single metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Delivered to the sink.
    Accepted,
    /// Undeliverable or evicted by backpressure.
    Rejected,
    /// Removed without a delivery attempt.
    Dropped,
}

/// Summary handed to the notify callback once a group completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub id: TrackingId,
    pub accepted: usize,
    pub rejected: usize,
    pub dropped: usize,
}

impl DeliveryInfo {
    /// True when every metric of the group was accepted.
    pub fn delivered(&self) -> bool {
        self.rejected == 0 && self.dropped == 0
    }
}

type NotifyFn = dyn Fn(&DeliveryInfo) + Send + Sync;

struct Group {
    id: TrackingId,
    pending: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    dropped: AtomicUsize,
    notify: Option<Box<NotifyFn>>,
    notified: AtomicBool,
}

impl Group {
    fn info(&self) -> DeliveryInfo {
        DeliveryInfo {
            id: self.id,
            accepted: self.accepted.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }

    fn resolve(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Accepted => &self.accepted,
            Disposition::Rejected => &self.rejected,
            Disposition::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1
            && !self.notified.swap(true, Ordering::SeqCst)
        {
            if let Some(notify) = &self.notify {
                notify(&self.info());
            }
        }
    }
}

/// Producer side of a tracking group.
#[derive(Clone)]
pub struct Tracker {
    group: Arc<Group>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.group.id)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Tracker {
    /// Create a group without a completion callback.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a group that calls `notify` when its last metric resolves.
    pub fn with_notify<F>(notify: F) -> Self
    where
        F: Fn(&DeliveryInfo) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(notify)))
    }

    fn build(notify: Option<Box<NotifyFn>>) -> Self {
        Tracker {
            group: Arc::new(Group {
                id: TrackingId::new(),
                pending: AtomicUsize::new(0),
                accepted: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
                dropped: AtomicUsize::new(0),
                notify,
                notified: AtomicBool::new(false),
            }),
        }
    }

    /// Attach `metric` to this group.
    pub fn track(&self, metric: Metric) -> Metric {
        self.group.pending.fetch_add(1, Ordering::SeqCst);
        metric.with_tracking(TrackingHandle {
            group: Arc::clone(&self.group),
            resolved: false,
        })
    }

    pub fn id(&self) -> TrackingId {
        self.group.id
    }

    pub fn pending(&self) -> usize {
        self.group.pending.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.group.accepted.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.group.rejected.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.group.dropped.load(Ordering::SeqCst)
    }

    /// Snapshot of the group's counters.
    pub fn info(&self) -> DeliveryInfo {
        self.group.info()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-metric membership in a tracking group.
///
/// Cloning a handle adds a pending member to the group.
pub struct TrackingHandle {
    group: Arc<Group>,
    resolved: bool,
}

impl TrackingHandle {
    pub fn id(&self) -> TrackingId {
        self.group.id
    }

    pub(crate) fn resolve(mut self, disposition: Disposition) {
        self.resolved = true;
        self.group.resolve(disposition);
    }
}

impl Clone for TrackingHandle {
    fn clone(&self) -> Self {
        self.group.pending.fetch_add(1, Ordering::SeqCst);
        TrackingHandle {
            group: Arc::clone(&self.group),
            resolved: false,
        }
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.group.resolve(Disposition::Dropped);
        }
    }
}

impl fmt::Debug for TrackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingHandle")
            .field("id", &self.group.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn metric(name: &str) -> Metric {
        Metric::new(name, Utc.timestamp_opt(0, 0).unwrap()).with_field("value", 1.0)
    }

    #[test]
    fn notify_fires_once_when_group_completes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = Tracker::with_notify(move |info| sink.lock().unwrap().push(info.clone()));

        let a = tracker.track(metric("a"));
        let b = tracker.track(metric("b"));
        assert_eq!(tracker.pending(), 2);

        a.accept();
        assert!(seen.lock().unwrap().is_empty());
        b.reject();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].accepted, 1);
        assert_eq!(seen[0].rejected, 1);
        assert!(!seen[0].delivered());
    }

    #[test]
    fn notify_does_not_fire_again_after_completion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let tracker = Tracker::with_notify(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker.track(metric("a")).accept();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tracker.track(metric("b")).accept();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.accepted(), 2);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn dropping_unresolved_metric_counts_as_dropped() {
        let tracker = Tracker::new();
        let m = tracker.track(metric("a"));
        drop(m);
        assert_eq!(tracker.dropped(), 1);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn cloned_metric_is_a_separate_member() {
        let tracker = Tracker::new();
        let m = tracker.track(metric("a"));
        let copy = m.clone();
        assert_eq!(tracker.pending(), 2);
        m.accept();
        copy.accept();
        assert_eq!(tracker.accepted(), 2);
        assert!(tracker.info().delivered());
    }
}
