//! Property tests for buffer accounting and ordering.

use chrono::{TimeZone, Utc};
use mr_buffer::{Buffer, BufferStats, Transaction, WalOptions};
use mr_common::{BufferStrategy, Metric};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Begin(usize),
    AcceptAll,
    KeepAll,
    /// Accept even positions, reject every third, keep the rest.
    Mixed,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..8).prop_map(Op::Add),
        2 => (0usize..8).prop_map(Op::Begin),
        2 => Just(Op::AcceptAll),
        1 => Just(Op::KeepAll),
        1 => Just(Op::Mixed),
    ]
}

fn open(strategy: BufferStrategy, capacity: usize, dir: &TempDir) -> Buffer {
    Buffer::with_wal_options(
        "prop",
        "",
        capacity,
        strategy,
        Some(dir.path()),
        WalOptions::default().without_sync(),
        BufferStats::unregistered().unwrap(),
    )
    .unwrap()
}

struct Run {
    buffer: Buffer,
    _dir: TempDir,
    tx: Option<Transaction>,
    next: i64,
    delivered: Vec<i64>,
}

impl Run {
    fn apply(&mut self, op: &Op) {
        match op {
            Op::Add(n) => {
                let metrics = (0..*n)
                    .map(|_| {
                        self.next += 1;
                        Metric::new("m", Utc.timestamp_opt(self.next, 0).unwrap())
                            .with_field("v", 1.0)
                    })
                    .collect();
                self.buffer.add(metrics);
            }
            Op::Begin(n) => {
                if self.tx.is_none() {
                    self.tx = Some(self.buffer.begin_transaction(*n).unwrap());
                }
            }
            Op::AcceptAll => {
                if let Some(mut tx) = self.tx.take() {
                    self.delivered
                        .extend(tx.batch().iter().map(|m| m.time().timestamp()));
                    tx.accept_all();
                    self.buffer.end_transaction(tx).unwrap();
                }
            }
            Op::KeepAll => {
                if let Some(tx) = self.tx.take() {
                    self.buffer.end_transaction(tx).unwrap();
                }
            }
            Op::Mixed => {
                if let Some(mut tx) = self.tx.take() {
                    for i in 0..tx.len() {
                        if i % 3 == 0 {
                            tx.reject(i);
                        } else if i % 2 == 0 {
                            tx.accept(i);
                        }
                    }
                    self.buffer.end_transaction(tx).unwrap();
                }
            }
        }
    }
}

fn run(strategy: BufferStrategy, capacity: usize, ops: &[Op]) -> Run {
    let dir = TempDir::new().unwrap();
    let mut run = Run {
        buffer: open(strategy, capacity, &dir),
        _dir: dir,
        tx: None,
        next: 0,
        delivered: Vec::new(),
    };
    for op in ops {
        run.apply(op);
        if strategy == BufferStrategy::Memory {
            assert!(run.buffer.len() <= capacity);
        }
    }
    if let Some(tx) = run.tx.take() {
        run.buffer.end_transaction(tx).unwrap();
    }
    run
}

fn conserved(run: &Run) -> bool {
    let stats = run.buffer.stats();
    stats.metrics_added()
        == stats.metrics_written()
            + stats.metrics_rejected()
            + stats.metrics_dropped()
            + run.buffer.len() as u64
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn memory_accounting_is_conserved(
        capacity in 1usize..12,
        ops in prop::collection::vec(op_strategy(), 0..60),
    ) {
        let run = run(BufferStrategy::Memory, capacity, &ops);
        prop_assert!(conserved(&run));
        prop_assert!(run.buffer.len() <= capacity);
    }

    #[test]
    fn disk_accounting_is_conserved(
        ops in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let run = run(BufferStrategy::Disk, 1, &ops);
        prop_assert!(conserved(&run));
    }

    #[test]
    fn whole_batches_deliver_oldest_first(
        capacity in 1usize..12,
        ops in prop::collection::vec(
            prop_oneof![
                3 => (1usize..8).prop_map(Op::Add),
                2 => (0usize..8).prop_map(Op::Begin),
                2 => Just(Op::AcceptAll),
                1 => Just(Op::KeepAll),
            ],
            0..60,
        ),
    ) {
        for strategy in [BufferStrategy::Memory, BufferStrategy::Disk] {
            let run = run(strategy, capacity, &ops);
            prop_assert!(
                run.delivered.windows(2).all(|w| w[0] < w[1]),
                "{strategy} delivered out of order: {:?}",
                run.delivered
            );
        }
    }
}
