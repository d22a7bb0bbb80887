//! Per-region front end that batches operations before publishing them to
//! the shared [`OperationLedger`].
//!
//! Grounded on the original's per-region `flush_operation` path: operations
//! accumulate into one cache-line-sized [`OperationBatch`] and are only
//! published once it fills, or the caller explicitly flushes a partial
//! batch at a cycle boundary.

use super::operation_ledger::OperationLedger;
use crate::config::OPERATIONS_PER_BATCH;
use crate::object::Object;
use crate::operation::{Operation, OperationBatch, OperationType};
use std::sync::Arc;

/// Accumulates one region's operations into batches for [`OperationLedger::publish`].
pub struct OperationWriter {
    ledger: Arc<OperationLedger>,
    batch: OperationBatch,
    filled: usize,
}

impl OperationWriter {
    #[must_use]
    pub fn new(ledger: Arc<OperationLedger>) -> Self {
        Self { ledger, batch: OperationBatch::empty(), filled: 0 }
    }

    /// Logs one operation, publishing the batch once it's full.
    pub fn write(&mut self, object: *mut Object, op_type: OperationType) {
        let operation = match op_type {
            OperationType::Increment => Operation::increment(object, 0),
            OperationType::Decrement => Operation::decrement(object, 0),
        };
        self.batch.operations_mut()[self.filled] = operation;
        self.filled += 1;
        if self.filled == OPERATIONS_PER_BATCH {
            self.flush();
        }
    }

    /// Publishes whatever the current batch holds, padded with
    /// [`Operation::null`], regardless of whether it's full. Called at
    /// every `SUBMIT` so a partially filled batch isn't held back a cycle.
    pub fn flush(&mut self) {
        if self.filled == 0 {
            return;
        }
        self.ledger.publish(self.batch);
        self.batch = OperationBatch::empty();
        self.filled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_object(addr: usize) -> *mut Object {
        addr as *mut Object
    }

    #[test]
    fn flush_is_a_no_op_on_an_empty_batch() {
        let ledger = Arc::new(OperationLedger::new(4));
        let mut writer = OperationWriter::new(Arc::clone(&ledger));
        writer.flush();
        let range = ledger.commit();
        assert_eq!(range.size(), 0);
    }

    #[test]
    fn partial_batch_publishes_on_explicit_flush() {
        let ledger = Arc::new(OperationLedger::new(4));
        let mut writer = OperationWriter::new(Arc::clone(&ledger));
        writer.write(fake_object(0x2000), OperationType::Increment);
        writer.flush();

        let range = ledger.commit();
        let mut seen = Vec::new();
        ledger.drain(range, |op| seen.push(op));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn full_batch_flushes_itself_without_an_explicit_call() {
        let ledger = Arc::new(OperationLedger::new(4));
        let mut writer = OperationWriter::new(Arc::clone(&ledger));
        for _ in 0..OPERATIONS_PER_BATCH {
            writer.write(fake_object(0x3000), OperationType::Decrement);
        }
        assert_eq!(writer.filled, 0);

        let range = ledger.commit();
        let mut seen = Vec::new();
        ledger.drain(range, |op| seen.push(op));
        assert_eq!(seen.len(), OPERATIONS_PER_BATCH);
    }
}
