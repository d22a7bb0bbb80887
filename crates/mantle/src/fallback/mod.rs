//! An alternative to [`crate::ledger`] for platforms (or kernels) without
//! `userfaultfd`: a single mutex-guarded ring of operation batches instead
//! of page-fault-guarded write-barrier segments. Trades the wait-free write
//! path for portability; the cycle semantics are unchanged.

mod operation_ledger;
mod operation_writer;

pub use operation_ledger::OperationLedger;
pub use operation_writer::OperationWriter;
