//! The tagged union regions and the domain exchange over a
//! [`crate::connection::Connection`].

use crate::ledger::WriteBarrier;
use crate::object_grouper::ObjectGroups;
use std::fmt;

/// A handle to the pair of write barriers a region just closed out,
/// carried across the connection in a `SUBMIT` message.
///
/// This is the canonical path described in SPEC_FULL.md's Open Questions:
/// the region hands the domain pointers to the barriers it just closed
/// rather than serializing operation ranges into a shared ledger. The
/// pointees are only read by the domain's
/// [`crate::region_controller::RegionController`] while walking them during
/// `SUBMIT_BARRIER`, a window bounded by the barrier protocol itself — the
/// region does not touch either barrier's committed segments again until
/// its next `ENTER`.
#[derive(Clone, Copy)]
pub struct WriteBarrierHandle {
    increment: *const WriteBarrier,
    decrement: *const WriteBarrier,
}

impl WriteBarrierHandle {
    pub(crate) fn new(increment: *const WriteBarrier, decrement: *const WriteBarrier) -> Self {
        Self { increment, decrement }
    }

    /// # Safety
    /// Valid only for the duration of the `SUBMIT_BARRIER` window for the
    /// cycle in which this handle was sent.
    #[must_use]
    pub(crate) unsafe fn increment_barrier(&self) -> &WriteBarrier {
        &*self.increment
    }

    /// # Safety
    /// See [`WriteBarrierHandle::increment_barrier`].
    #[must_use]
    pub(crate) unsafe fn decrement_barrier(&self) -> &WriteBarrier {
        &*self.decrement
    }
}

impl fmt::Debug for WriteBarrierHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteBarrierHandle(inc={:p}, dec={:p})", self.increment, self.decrement)
    }
}

// SAFETY: see the type-level doc comment — handed off under the barrier
// protocol's own exclusion window, not used concurrently by two threads.
unsafe impl Send for WriteBarrierHandle {}

/// Messages exchanged between a region and the domain.
#[derive(Debug)]
pub enum Message {
    /// Region → domain: "I have work (or a reason to cycle); admit me to
    /// the barrier."
    Start,
    /// Domain → region: "the global cycle has advanced to `cycle`."
    Enter { cycle: u64 },
    /// Region → domain: the region's closed-out write barrier, plus
    /// whether the region wants to stop once this cycle's bookkeeping is
    /// done.
    Submit { stop: bool, write_barrier: WriteBarrierHandle },
    /// Domain → region: objects this region's controller applied to zero,
    /// bucketed for finalization.
    Retire { object_groups: ObjectGroups },
    /// Domain → region: the cycle is complete; `stop` is set once the
    /// domain has observed the region's stop request and it is safe to
    /// halt.
    Leave { stop: bool },
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Message::Start => "START",
            Message::Enter { .. } => "ENTER",
            Message::Submit { .. } => "SUBMIT",
            Message::Retire { .. } => "RETIRE",
            Message::Leave { .. } => "LEAVE",
        };
        f.write_str(name)
    }
}
