//! Loom-based interleaving tests for the write-barrier hand-off protocol.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! The real [`mantle::ledger::Ledger`] coordinates a region thread writing
//! through a cursor against the domain thread unprotecting a guard page via
//! `userfaultfd`, which loom cannot model (it isn't a memory operation loom
//! understands). This instead isolates the one interleaving that actually
//! needs checking: a region publishing a barrier pointer via `Release` and
//! the domain reading it via `Acquire` to snapshot a consistent count,
//! mirroring `Ledger::step`'s commit/rotate handoff.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

/// Stand-in for one write-barrier segment: a count of pointers written
/// before the region committed it.
struct Segment {
    count: AtomicUsize,
}

/// Stand-in for `Ledger::step`'s handoff: the region publishes a pointer to
/// the segment it just committed; the domain reads that pointer and the
/// count underneath it.
struct Handoff {
    committed: AtomicPtr<Segment>,
}

impl Handoff {
    fn new() -> Self {
        Self { committed: AtomicPtr::new(std::ptr::null_mut()) }
    }
}

#[test]
fn domain_observes_a_fully_written_segment_or_none_at_all() {
    loom::model(|| {
        let handoff = Arc::new(Handoff::new());
        let handoff_region = Arc::clone(&handoff);

        let region = thread::spawn(move || {
            let segment = Box::into_raw(Box::new(Segment { count: AtomicUsize::new(0) }));
            // SAFETY: no other thread can see `segment` until the
            // `Release` store below publishes it.
            unsafe {
                (*segment).count.store(3, Ordering::Relaxed);
            }
            handoff_region.committed.store(segment, Ordering::Release);
        });

        let observed = {
            let ptr = handoff.committed.load(Ordering::Acquire);
            if ptr.is_null() {
                None
            } else {
                // SAFETY: a non-null pointer was published after its count
                // was written, and `Acquire` on the same atomic pairs with
                // the region's `Release` store above.
                Some(unsafe { (*ptr).count.load(Ordering::Relaxed) })
            }
        };

        region.join().unwrap();

        // The domain either sees nothing yet, or the fully written count;
        // it never observes a segment whose count write hasn't landed.
        assert!(observed.is_none() || observed == Some(3));

        let published = handoff.committed.load(Ordering::Relaxed);
        // SAFETY: the region thread has joined, so no one else touches this.
        unsafe {
            drop(Box::from_raw(published));
        }
    });
}

#[test]
fn two_rotations_are_seen_in_order_or_not_at_all() {
    loom::model(|| {
        let handoff = Arc::new(Handoff::new());
        let handoff_region = Arc::clone(&handoff);

        let region = thread::spawn(move || {
            let first = Box::into_raw(Box::new(Segment { count: AtomicUsize::new(1) }));
            handoff_region.committed.store(first, Ordering::Release);

            let second = Box::into_raw(Box::new(Segment { count: AtomicUsize::new(2) }));
            handoff_region.committed.store(second, Ordering::Release);
            (first, second)
        });

        let first_read = handoff.committed.load(Ordering::Acquire);
        let first_count = if first_read.is_null() {
            None
        } else {
            Some(unsafe { (*first_read).count.load(Ordering::Relaxed) })
        };

        let (first, second) = region.join().unwrap();

        // Whatever the domain saw on its single read was a fully formed
        // segment with count 1 or count 2, never a torn or stale value.
        assert!(matches!(first_count, None | Some(1) | Some(2)));

        // SAFETY: the region thread has joined; both segments are
        // unreachable from any other thread now.
        unsafe {
            drop(Box::from_raw(first));
            drop(Box::from_raw(second));
        }
    });
}
