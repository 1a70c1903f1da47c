//! Behavioural suite shared by both buffer backends, plus the eviction cases
//! that only apply to the bounded memory ring.

use std::ops::Deref;

use chrono::{TimeZone, Utc};
use mr_buffer::{Buffer, BufferStats, Transaction, WalOptions};
use mr_common::{BufferStrategy, Metric, Tracker};
use tempfile::TempDir;

fn metric() -> Metric {
    metric_at(0)
}

fn metric_at(sec: i64) -> Metric {
    Metric::new("cpu", Utc.timestamp_opt(sec, 0).unwrap()).with_field("value", 42.0)
}

fn metrics(secs: impl IntoIterator<Item = i64>) -> Vec<Metric> {
    secs.into_iter().map(metric_at).collect()
}

fn copies(n: usize) -> Vec<Metric> {
    (0..n).map(|_| metric()).collect()
}

fn secs(tx: &Transaction) -> Vec<i64> {
    tx.batch().iter().map(|m| m.time().timestamp()).collect()
}

struct TestBuffer {
    buffer: Buffer,
    _dir: Option<TempDir>,
}

impl TestBuffer {
    fn new(strategy: BufferStrategy, capacity: usize) -> Self {
        let dir = match strategy {
            BufferStrategy::Disk => Some(TempDir::new().unwrap()),
            BufferStrategy::Memory => None,
        };
        let buffer = Buffer::with_wal_options(
            "test",
            "",
            capacity,
            strategy,
            dir.as_ref().map(|d| d.path()),
            WalOptions::default().without_sync(),
            BufferStats::unregistered().unwrap(),
        )
        .unwrap();
        TestBuffer {
            buffer,
            _dir: dir,
        }
    }

    fn batch(&self, n: usize) -> Transaction {
        self.buffer.begin_transaction(n).unwrap()
    }

    fn accept(&self, mut tx: Transaction) {
        tx.accept_all();
        self.buffer.end_transaction(tx).unwrap();
    }

    fn keep(&self, tx: Transaction) {
        self.buffer.end_transaction(tx).unwrap();
    }

    fn dropped(&self) -> u64 {
        self.buffer.stats().metrics_dropped()
    }

    fn written(&self) -> u64 {
        self.buffer.stats().metrics_written()
    }
}

impl Deref for TestBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

macro_rules! buffer_suite {
    ($module:ident, $strategy:expr) => {
        mod $module {
            use super::*;

            fn buffer(capacity: usize) -> TestBuffer {
                TestBuffer::new($strategy, capacity)
            }

            #[test]
            fn len_empty() {
                assert_eq!(buffer(5).len(), 0);
            }

            #[test]
            fn len_one() {
                let b = buffer(5);
                b.add(vec![metric()]);
                assert_eq!(b.len(), 1);
            }

            #[test]
            fn len_full() {
                let b = buffer(5);
                b.add(copies(5));
                assert_eq!(b.len(), 5);
            }

            #[test]
            fn batch_len_zero() {
                let b = buffer(5);
                b.add(copies(3));
                assert!(b.batch(0).is_empty());
            }

            #[test]
            fn batch_len_buffer_empty() {
                assert!(buffer(5).batch(2).is_empty());
            }

            #[test]
            fn batch_len_underfill() {
                let b = buffer(5);
                b.add(vec![metric()]);
                assert_eq!(b.batch(2).len(), 1);
            }

            #[test]
            fn batch_len_fill() {
                let b = buffer(5);
                b.add(copies(3));
                assert_eq!(b.batch(2).len(), 2);
            }

            #[test]
            fn batch_len_exact() {
                let b = buffer(5);
                b.add(copies(2));
                assert_eq!(b.batch(2).len(), 2);
            }

            #[test]
            fn batch_len_larger_than_buffer() {
                let b = buffer(5);
                b.add(copies(5));
                assert_eq!(b.batch(6).len(), 5);
            }

            #[test]
            fn batch_wrap() {
                let b = buffer(5);
                b.add(copies(5));
                let tx = b.batch(2);
                b.accept(tx);
                b.add(copies(2));
                assert_eq!(b.batch(5).len(), 5);
            }

            #[test]
            fn batch_oldest_first() {
                let b = buffer(4);
                b.add(metrics(1..=3));
                assert_eq!(secs(&b.batch(2)), vec![1, 2]);
            }

            #[test]
            fn multiple_batches() {
                let b = buffer(10);
                b.add(metrics(1..=6));
                let tx = b.batch(5);
                assert_eq!(secs(&tx), vec![1, 2, 3, 4, 5]);
                b.accept(tx);
                let tx = b.batch(5);
                assert_eq!(secs(&tx), vec![6]);
                b.accept(tx);
                assert_eq!(b.len(), 0);
            }

            #[test]
            fn keep_with_room() {
                let b = buffer(5);
                b.add(metrics(1..=3));
                let tx = b.batch(2);
                b.add(metrics(4..=5));
                b.keep(tx);
                assert_eq!(b.dropped(), 0);
                assert_eq!(secs(&b.batch(5)), vec![1, 2, 3, 4, 5]);
            }

            #[test]
            fn keep_nothing_new_full() {
                let b = buffer(5);
                b.add(metrics(1..=5));
                let tx = b.batch(2);
                b.keep(tx);
                assert_eq!(b.dropped(), 0);
                assert_eq!(secs(&b.batch(5)), vec![1, 2, 3, 4, 5]);
            }

            #[test]
            fn keep_room_exact() {
                let b = buffer(5);
                b.add(metrics(1..=2));
                let tx = b.batch(2);
                b.add(metrics(3..=5));
                b.keep(tx);
                assert_eq!(b.dropped(), 0);
                assert_eq!(secs(&b.batch(5)), vec![1, 2, 3, 4, 5]);
            }

            #[test]
            fn accept_removes_batch() {
                let b = buffer(5);
                b.add(copies(3));
                let tx = b.batch(2);
                b.accept(tx);
                assert_eq!(b.len(), 1);
                assert_eq!(b.written(), 2);
            }

            #[test]
            fn keep_leaves_batch() {
                let b = buffer(5);
                b.add(copies(3));
                let tx = b.batch(2);
                b.keep(tx);
                assert_eq!(b.len(), 3);
            }

            #[test]
            fn outstanding_batch_still_counted() {
                let b = buffer(5);
                b.add(copies(5));
                let _tx = b.batch(2);
                assert_eq!(b.len(), 5);
            }

            #[test]
            fn ending_empty_batch_is_harmless() {
                let b = buffer(5);
                let tx = b.batch(2);
                b.add(vec![metric_at(1)]);
                b.keep(tx);
                b.add(vec![metric_at(2)]);
                assert_eq!(secs(&b.batch(2)), vec![1, 2]);
            }

            #[test]
            fn partial_accept_keeps_order() {
                let b = buffer(10);
                b.add(metrics(1..=5));
                let mut tx = b.batch(5);
                tx.accept(0);
                tx.accept(1);
                b.keep(tx);
                assert_eq!(b.len(), 3);
                assert_eq!(secs(&b.batch(10)), vec![3, 4, 5]);
            }

            #[test]
            fn added_counter_tracks_stored_metrics() {
                let b = buffer(5);
                b.add(copies(3));
                assert_eq!(b.stats().metrics_added(), 3);
            }
        }
    };
}

buffer_suite!(memory, BufferStrategy::Memory);
buffer_suite!(disk, BufferStrategy::Disk);

mod memory_eviction {
    use super::*;

    fn buffer(capacity: usize) -> TestBuffer {
        TestBuffer::new(BufferStrategy::Memory, capacity)
    }

    #[test]
    fn len_overfill() {
        let b = buffer(5);
        assert_eq!(b.add(copies(6)), 1);
        assert_eq!(b.len(), 5);
    }

    #[test]
    fn batch_latest_wrap() {
        let b = buffer(4);
        b.add(metrics(1..=5));
        assert_eq!(secs(&b.batch(2)), vec![2, 3]);
    }

    #[test]
    fn keep_no_room() {
        let b = buffer(5);
        b.add(metrics(1..=3));
        let tx = b.batch(2);
        b.add(metrics(4..=8));
        b.keep(tx);
        assert_eq!(b.dropped(), 3);
        assert_eq!(secs(&b.batch(5)), vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn kept_batch_loses_to_newer_metrics_when_full() {
        let b = buffer(5);
        b.add(metrics(1..=5));
        let tx = b.batch(2);
        assert_eq!(secs(&tx), vec![1, 2]);
        assert_eq!(b.add(metrics(6..=7)), 0);
        b.keep(tx);
        assert_eq!(b.dropped(), 2);
        assert_eq!(secs(&b.batch(5)), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn keep_room_overwrite_old() {
        let b = buffer(5);
        b.add(metrics(1..=3));
        let tx = b.batch(1);
        b.add(metrics(4..=6));
        b.keep(tx);
        assert_eq!(b.dropped(), 1);
        assert_eq!(secs(&b.batch(5)), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn keep_partial_room() {
        let b = buffer(5);
        b.add(metrics(1..=3));
        let tx = b.batch(2);
        b.add(metrics(4..=7));
        b.keep(tx);
        assert_eq!(b.dropped(), 2);
        assert_eq!(secs(&b.batch(5)), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn keep_new_metrics_wrapped() {
        let b = buffer(5);
        b.add(metrics(1..=3));
        let tx = b.batch(2);
        b.add(metrics(4..=5));
        assert_eq!(b.dropped(), 0);

        // The ring fills, then evictions eat into the outstanding batch.
        b.add(metrics(6..=10));
        assert_eq!(b.dropped(), 3);

        b.add(metrics(11..=15));
        assert_eq!(b.dropped(), 8);

        b.keep(tx);
        assert_eq!(b.dropped(), 10);
        assert_eq!(secs(&b.batch(5)), vec![11, 12, 13, 14, 15]);
    }

    #[test]
    fn keep_wrapped() {
        let b = buffer(5);
        b.add(metrics(1..=8));
        let tx = b.batch(3);
        b.add(metrics(9..=12));
        b.keep(tx);
        assert_eq!(secs(&b.batch(5)), vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn keep_adjusts_first() {
        let b = buffer(10);
        b.add(metrics(1..=3));
        let tx = b.batch(3);
        b.add(metrics(4..=6));
        b.keep(tx);

        b.add(metrics(7..=9));
        let tx = b.batch(3);
        b.add(metrics(10..=12));
        b.keep(tx);

        b.add(metrics(13..=15));
        let tx = b.batch(3);
        b.add(metrics(16..=18));
        b.keep(tx);

        b.add(metrics(19..=19));
        assert_eq!(secs(&b.batch(10)), (10..=19).collect::<Vec<_>>());
    }

    #[test]
    fn add_drops_overwritten_metrics() {
        let b = buffer(5);
        b.add(copies(5));
        b.add(copies(5));
        assert_eq!(b.dropped(), 5);
        assert_eq!(b.written(), 0);
    }

    #[test]
    fn accept_writes_overwritten_batch() {
        let b = buffer(5);
        b.add(copies(5));
        let tx = b.batch(5);
        b.add(copies(5));
        b.accept(tx);
        assert_eq!(b.dropped(), 0);
        assert_eq!(b.written(), 5);
    }

    #[test]
    fn keep_drops_overwritten_batch() {
        let b = buffer(5);
        b.add(copies(5));
        let tx = b.batch(5);
        b.add(copies(5));
        b.keep(tx);
        assert_eq!(b.dropped(), 5);
        assert_eq!(b.written(), 0);
    }

    #[test]
    fn metrics_overwrite_batch_accept() {
        let b = buffer(5);
        b.add(copies(5));
        let tx = b.batch(3);
        b.add(copies(3));
        b.accept(tx);
        assert_eq!(b.dropped(), 0, "dropped");
        assert_eq!(b.written(), 3, "written");
    }

    #[test]
    fn metrics_overwrite_batch_keep() {
        let b = buffer(5);
        b.add(copies(5));
        let tx = b.batch(3);
        b.add(copies(3));
        b.keep(tx);
        assert_eq!(b.dropped(), 3);
        assert_eq!(b.written(), 0);
    }

    #[test]
    fn metrics_batch_accept_removed() {
        let b = buffer(5);
        b.add(copies(5));
        let tx = b.batch(3);
        b.add(copies(5));
        b.accept(tx);
        assert_eq!(b.dropped(), 2);
        assert_eq!(b.written(), 3);
    }

    #[test]
    fn wrap_with_batch() {
        let b = buffer(5);
        b.add(copies(3));
        let _tx = b.batch(3);
        b.add(copies(6));
        assert_eq!(b.dropped(), 1);
    }

    #[test]
    fn accept_calls_metric_accept() {
        let tracker = Tracker::new();
        let b = buffer(5);
        b.add((0..3).map(|_| tracker.track(metric())).collect());
        let tx = b.batch(2);
        b.accept(tx);
        assert_eq!(tracker.accepted(), 2);
    }

    #[test]
    fn add_calls_reject_when_no_batch() {
        let tracker = Tracker::new();
        let b = buffer(5);
        b.add((0..5).map(|_| tracker.track(metric())).collect());
        b.add((0..2).map(|_| tracker.track(metric())).collect());
        assert_eq!(tracker.rejected(), 2);
    }

    #[test]
    fn add_calls_reject_when_not_in_batch() {
        let tracker = Tracker::new();
        let b = buffer(5);
        b.add((0..5).map(|_| tracker.track(metric())).collect());
        let tx = b.batch(2);
        b.add((0..4).map(|_| tracker.track(metric())).collect());
        assert_eq!(tracker.rejected(), 2);
        b.keep(tx);
        assert_eq!(tracker.rejected(), 4);
    }

    #[test]
    fn keep_calls_reject_with_overwritten() {
        let tracker = Tracker::new();
        let b = buffer(5);
        b.add((0..5).map(|_| tracker.track(metric())).collect());
        let tx = b.batch(5);
        b.add((0..2).map(|_| tracker.track(metric())).collect());
        assert_eq!(tracker.rejected(), 0);
        b.keep(tx);
        assert_eq!(tracker.rejected(), 2);
    }

    #[test]
    fn add_overwrite_and_keep() {
        let tracker = Tracker::new();
        let b = buffer(5);
        b.add((0..5).map(|_| tracker.track(metric())).collect());
        let tx = b.batch(5);
        for _ in 0..4 {
            b.add((0..5).map(|_| tracker.track(metric())).collect());
        }
        assert_eq!(tracker.rejected(), 15);
        b.keep(tx);
        assert_eq!(tracker.rejected(), 20);
    }

    #[test]
    fn add_overwrite_and_accept_offset() {
        let tracker = Tracker::new();
        let b = buffer(5);
        let tracked = |n: usize| (0..n).map(|_| tracker.track(metric())).collect::<Vec<_>>();

        b.add(tracked(3));
        b.add(tracked(4));
        assert_eq!(tracker.rejected(), 2);
        let tx = b.batch(5);
        b.add(tracked(4));
        assert_eq!(tracker.rejected(), 2);
        b.add(tracked(4));
        assert_eq!(tracker.rejected(), 5);
        b.add(tracked(4));
        assert_eq!(tracker.rejected(), 9);
        b.add(tracked(4));
        assert_eq!(tracker.rejected(), 13);
        b.accept(tx);
        assert_eq!(tracker.rejected(), 13);
        assert_eq!(tracker.accepted(), 5);
    }
}

mod disk_unbounded {
    use super::*;

    #[test]
    fn len_overfill_is_not_capped() {
        let b = TestBuffer::new(BufferStrategy::Disk, 5);
        assert_eq!(b.add(copies(6)), 0);
        assert_eq!(b.len(), 6);
        assert_eq!(b.dropped(), 0);
    }

    #[test]
    fn add_accepts_tracked_metrics_on_write() {
        let tracker = Tracker::new();
        let b = TestBuffer::new(BufferStrategy::Disk, 5);
        b.add((0..3).map(|_| tracker.track(metric())).collect());
        assert_eq!(tracker.accepted(), 3);
        let tx = b.batch(2);
        b.accept(tx);
        assert_eq!(tracker.accepted(), 3);
    }
}
