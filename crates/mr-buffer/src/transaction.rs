//! Batches handed out by a buffer and their per-position outcomes.

use mr_common::Metric;

/// Outcome recorded for one position of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Not delivered yet; the buffer retries it.
    Keep,
    /// Delivered.
    Accept,
    /// Undeliverable; dropped permanently.
    Reject,
}

/// An ordered batch of the oldest unresolved metrics.
///
/// The consumer marks positions and returns the transaction to the buffer it
/// came from with `end_transaction`, which consumes it. Unmarked positions are
/// kept for a later batch. Marking the same position twice keeps the last mark.
#[derive(Debug, Default)]
pub struct Transaction {
    batch: Vec<Metric>,
    marks: Vec<Mark>,
    /// Log offsets relative to the read index at batch time (disk only).
    pub(crate) offsets: Vec<u64>,
}

impl Transaction {
    pub(crate) fn new(batch: Vec<Metric>) -> Self {
        let marks = vec![Mark::Keep; batch.len()];
        Transaction {
            batch,
            marks,
            offsets: Vec::new(),
        }
    }

    pub(crate) fn with_offsets(batch: Vec<Metric>, offsets: Vec<u64>) -> Self {
        let mut tx = Self::new(batch);
        tx.offsets = offsets;
        tx
    }

    /// Metrics in delivery order.
    pub fn batch(&self) -> &[Metric] {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Mark every position as delivered.
    pub fn accept_all(&mut self) {
        self.marks.fill(Mark::Accept);
    }

    /// Clear all marks so the whole batch is retried.
    pub fn keep_all(&mut self) {
        self.marks.fill(Mark::Keep);
    }

    /// Mark one position as delivered. Out-of-range positions are ignored.
    pub fn accept(&mut self, index: usize) {
        self.set(index, Mark::Accept);
    }

    /// Mark one position as undeliverable. Out-of-range positions are ignored.
    pub fn reject(&mut self, index: usize) {
        self.set(index, Mark::Reject);
    }

    fn set(&mut self, index: usize, mark: Mark) {
        if let Some(slot) = self.marks.get_mut(index) {
            *slot = mark;
        }
    }

    pub fn mark(&self, index: usize) -> Option<Mark> {
        self.marks.get(index).copied()
    }

    /// Positions marked as delivered, ascending.
    pub fn accepted(&self) -> Vec<usize> {
        self.positions(Mark::Accept)
    }

    /// Positions marked as undeliverable, ascending.
    pub fn rejected(&self) -> Vec<usize> {
        self.positions(Mark::Reject)
    }

    /// Positions left unmarked, ascending.
    pub fn kept(&self) -> Vec<usize> {
        self.positions(Mark::Keep)
    }

    fn positions(&self, mark: Mark) -> Vec<usize> {
        self.marks
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == mark)
            .map(|(i, _)| i)
            .collect()
    }

    /// Consume the transaction into `(metric, mark)` pairs in batch order.
    pub(crate) fn into_marked(self) -> impl Iterator<Item = (Metric, Mark)> {
        self.batch.into_iter().zip(self.marks)
    }
}
