//! A bounded, mutex-guarded log of operation batches, standing in for the
//! page-fault-driven [`crate::ledger::Ledger`] where `userfaultfd` isn't
//! available.
//!
//! Grounded on the original `Ledger`'s cycle bookkeeping, minus the
//! write-barrier/segment machinery: one shared [`Ring`] of
//! [`OperationBatch`]es plays the role of every region's write barriers
//! combined, and a [`SequenceRangeHistory`] remembers each cycle's
//! boundary the same way `Ledger::step` does. Writers that find the ring
//! full back off (spin, then yield, then block on a condition variable)
//! instead of trapping in the kernel.

use crate::backoff::Backoff;
use crate::config::TRANSACTION_LOG_HISTORY;
use crate::operation::{Operation, OperationBatch};
use crate::ring::{Ring, SequenceRange, SequenceRangeHistory};
use std::sync::{Condvar, Mutex};

struct Inner {
    batches: Ring<OperationBatch>,
    history: SequenceRangeHistory,
    tail: u64,
    committed_head: u64,
}

/// Shared sink for every region's batched operations.
pub struct OperationLedger {
    inner: Mutex<Inner>,
    not_full: Condvar,
}

impl OperationLedger {
    /// Builds a ledger with room for `capacity` batches.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                batches: Ring::new(capacity, OperationBatch::empty()),
                history: SequenceRangeHistory::new(TRANSACTION_LOG_HISTORY),
                tail: 0,
                committed_head: 0,
            }),
            not_full: Condvar::new(),
        }
    }

    /// Appends a batch, blocking while the ring is at capacity (which only
    /// happens if the domain falls multiple cycles behind every writer).
    pub fn publish(&self, batch: OperationBatch) {
        let mut inner = self.inner.lock().unwrap();
        let capacity = inner.batches.capacity() as u64;
        let mut backoff = Backoff::new();

        while inner.tail - inner.committed_head >= capacity {
            if backoff.is_completed() {
                inner = self.not_full.wait(inner).unwrap();
            } else {
                drop(inner);
                backoff.snooze();
                inner = self.inner.lock().unwrap();
            }
        }

        let tail = inner.tail;
        inner.batches.set(tail, batch);
        inner.tail = tail + 1;
    }

    /// Closes out the current cycle: every batch published so far becomes
    /// part of the range this call returns, and the ring's writable region
    /// grows back to make room for them.
    pub fn commit(&self) -> SequenceRange {
        let mut inner = self.inner.lock().unwrap();
        let tail = inner.tail;
        inner.history.insert(tail);
        let range = inner.history.select(0);
        inner.committed_head = tail;
        self.not_full.notify_all();
        range
    }

    /// Visits every non-null operation in `[range.head, range.tail)`.
    pub fn drain(&self, range: SequenceRange, mut visit: impl FnMut(Operation)) {
        let inner = self.inner.lock().unwrap();
        let mut sequence = range.head;
        while sequence < range.tail {
            for &operation in inner.batches.get(sequence).operations() {
                if !operation.is_null() {
                    visit(operation);
                }
            }
            sequence += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    fn fake_object(addr: usize) -> *mut Object {
        addr as *mut Object
    }

    #[test]
    fn publish_then_commit_then_drain_round_trips_one_batch() {
        let ledger = OperationLedger::new(4);
        let mut batch = OperationBatch::empty();
        batch.operations_mut()[0] = Operation::increment(fake_object(0x1000), 0);
        ledger.publish(batch);

        let range = ledger.commit();
        assert_eq!(range.size(), 1);

        let mut seen = Vec::new();
        ledger.drain(range, |op| seen.push(op));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].object(), Some(fake_object(0x1000)));
    }

    #[test]
    fn commit_with_nothing_published_yields_empty_range() {
        let ledger = OperationLedger::new(4);
        let range = ledger.commit();
        assert_eq!(range.size(), 0);
    }
}
