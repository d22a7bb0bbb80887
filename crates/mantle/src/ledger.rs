//! The per-region, page-fault-driven log of pending reference-count
//! operations.
//!
//! Grounded directly on the original `Ledger`/`WriteBarrier`/
//! `WriteBarrierSegment`/`WriteBarrierManager` (`include/mantle/ledger.h`,
//! `src/ledger.cpp`): a ledger owns four barriers, one per phase of the
//! cycle; each barrier is a stack of page-aligned segments; a segment's
//! trailing guard page is write-protected while primed and stamped with the
//! segment's own address, so the page-fault handler can recover which
//! segment just filled from the faulting write alone.

use crate::object::Object;
use crate::page_fault::{Mode as FaultMode, PageFaultHandler};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Mutex;

const PAGE_SIZE: usize = 4096;

/// Number of pointer slots a segment can hold before its guard page traps
/// the next write. Matches [`crate::config::DEFAULT_SEGMENT_CAPACITY`] by
/// default but a ledger may be built with a different capacity (see the
/// low-latency / high-throughput presets).
const WRITE_BARRIER_PHASE_COUNT: usize = 4;

/// Which of the four rotating roles a barrier currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum WriteBarrierPhase {
    StoreDecrements = 0,
    Wait = 1,
    StoreIncrements = 2,
    Sync = 3,
}

impl WriteBarrierPhase {
    fn from_u64(value: u64) -> Self {
        match value % WRITE_BARRIER_PHASE_COUNT as u64 {
            0 => Self::StoreDecrements,
            1 => Self::Wait,
            2 => Self::StoreIncrements,
            _ => Self::Sync,
        }
    }
}

/// A page-aligned, privately-mapped span of memory backing one segment.
/// Owns its mapping for the segment's lifetime; mappings are recycled by
/// the [`WriteBarrierManager`]'s segment pool rather than torn down and
/// remapped on every reuse.
struct PrivateMemoryMapping {
    ptr: *mut u8,
    len: usize,
}

impl PrivateMemoryMapping {
    fn new(len: usize) -> Self {
        debug_assert!(len >= PAGE_SIZE && len % PAGE_SIZE == 0);
        // SAFETY: a plain anonymous private mapping with no file backing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            crate::protocol_violation!("mmap failed: {}", std::io::Error::last_os_error());
        }
        let ptr = ptr.cast::<u8>();
        // Touch each page once so the first fault recorded against this
        // mapping is the guard-page fault we arm later, not a cold-page one.
        for offset in (0..len).step_by(PAGE_SIZE) {
            // SAFETY: `offset` is within the mapping just created.
            unsafe {
                ptr.add(offset).write_volatile(0);
            }
        }
        Self { ptr, len }
    }

    fn memory(&self) -> &[u8] {
        // SAFETY: `ptr`/`len` describe the live mapping for `self`'s lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access via `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PrivateMemoryMapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping owned exclusively by `self`.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}

/// A page-aligned buffer of pending object-pointer slots, terminated by a
/// write-protected guard page.
pub struct WriteBarrierSegment {
    prev: *mut WriteBarrierSegment,
    barrier: *mut WriteBarrier,
    primed: bool,
    increment_count: usize,
    decrement_count: usize,
    mapping: PrivateMemoryMapping,
}

impl WriteBarrierSegment {
    fn new(capacity: usize) -> Self {
        let bytes = capacity * std::mem::size_of::<*mut Object>() + PAGE_SIZE;
        Self {
            prev: std::ptr::null_mut(),
            barrier: std::ptr::null_mut(),
            primed: false,
            increment_count: 0,
            decrement_count: 0,
            mapping: PrivateMemoryMapping::new(bytes),
        }
    }

    fn slots(&self) -> &[*mut Object] {
        let bytes = self.mapping.memory();
        let count = (bytes.len() - PAGE_SIZE) / std::mem::size_of::<*mut Object>();
        // SAFETY: the mapping is sized and aligned for `count` pointer slots
        // followed by a trailing guard page.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<*mut Object>(), count) }
    }

    fn is_primed(&self) -> bool {
        self.primed
    }

    /// Pointer to the next free slot: the write-barrier cursor value that
    /// gets published to the owning region's thread-local cursor.
    fn cursor(&self) -> *mut *mut Object {
        let slots = self.slots();
        let offset = self.increment_count + self.decrement_count;
        crate::invariants::debug_assert_cursor_in_bounds!(offset, slots.len());
        // SAFETY: `increment_count + decrement_count` never exceeds the
        // segment's slot count (the guard page traps before it can).
        unsafe { slots.as_ptr().add(offset).cast_mut() }
    }

    fn guard_page(&self) -> &[u8] {
        let bytes = self.mapping.memory();
        &bytes[bytes.len() - PAGE_SIZE..]
    }

    fn guard_page_mut(&mut self) -> &mut [u8] {
        let len = self.mapping.memory().len();
        &mut self.mapping.memory_mut()[len - PAGE_SIZE..]
    }

    /// Pending increments, once this segment has been committed.
    #[must_use]
    pub fn increments(&self) -> &[*mut Object] {
        &self.slots()[..self.increment_count]
    }

    /// Pending decrements, once this segment has been committed.
    #[must_use]
    pub fn decrements(&self) -> &[*mut Object] {
        &self.slots()[self.increment_count..self.increment_count + self.decrement_count]
    }
}

/// A stack of segments playing one of a ledger's four rotating phase roles.
pub struct WriteBarrier {
    phase_shift: u64,
    sequence: *const AtomicU64,
    stack: UnsafeCell<*mut WriteBarrierSegment>,
    increment_cursor: *const AtomicPtr<*mut Object>,
    decrement_cursor: *const AtomicPtr<*mut Object>,
}

// SAFETY: a `WriteBarrier`'s stack is only ever touched by the single
// region thread that owns its ledger, and by the domain thread during the
// page-fault handler's commit/push sequence, which is itself serialized by
// the fact that only one fault can be in flight for a given segment at a
// time (the guard page that traps it is the only writer).
unsafe impl Send for WriteBarrier {}
unsafe impl Sync for WriteBarrier {}

impl WriteBarrier {
    fn phase(&self) -> WriteBarrierPhase {
        // SAFETY: `sequence` outlives every barrier built from the same ledger.
        let sequence = unsafe { (*self.sequence).load(Ordering::Acquire) };
        WriteBarrierPhase::from_u64(sequence + self.phase_shift)
    }

    pub(crate) fn is_empty(&self) -> bool {
        // SAFETY: only this barrier's owning thread reads `stack` outside
        // of the fault-handler's commit window.
        unsafe { (*self.stack.get()).is_null() }
    }

    /// The most recently pushed segment, or null if the barrier is empty.
    pub(crate) fn back(&self) -> *mut WriteBarrierSegment {
        // SAFETY: see `is_empty`.
        unsafe { *self.stack.get() }
    }

    fn push_back(&self, segment: *mut WriteBarrierSegment) {
        debug_assert!(!segment.is_null());
        // SAFETY: `segment` is a live, primed, detached segment from the pool.
        unsafe {
            debug_assert!((*segment).barrier.is_null());
            debug_assert!((*segment).prev.is_null());
            debug_assert_eq!((*segment).increment_count, 0);
            debug_assert_eq!((*segment).decrement_count, 0);
            crate::invariants::debug_assert_primed!((*segment));

            (*segment).barrier = std::ptr::from_ref(self).cast_mut();
            (*segment).prev = *self.stack.get();

            match self.phase() {
                WriteBarrierPhase::StoreIncrements => {
                    (*self.increment_cursor).store((*segment).cursor(), Ordering::Release);
                }
                WriteBarrierPhase::StoreDecrements => {
                    (*self.decrement_cursor).store((*segment).cursor(), Ordering::Release);
                }
                _ => {}
            }

            *self.stack.get() = segment;
        }
    }

    /// Detaches and returns the most recently pushed segment, or null if the
    /// barrier is empty.
    pub(crate) fn pop_back(&self) -> *mut WriteBarrierSegment {
        // SAFETY: see `is_empty`.
        let top = unsafe { *self.stack.get() };
        if top.is_null() {
            return std::ptr::null_mut();
        }

        match self.phase() {
            WriteBarrierPhase::StoreIncrements => {
                // SAFETY: `increment_cursor` outlives every barrier.
                unsafe { (*self.increment_cursor).store(std::ptr::null_mut(), Ordering::Release) };
            }
            WriteBarrierPhase::StoreDecrements => {
                // SAFETY: `decrement_cursor` outlives every barrier.
                unsafe { (*self.decrement_cursor).store(std::ptr::null_mut(), Ordering::Release) };
            }
            _ => {}
        }

        // SAFETY: `top` was pushed by `push_back` and is still attached.
        unsafe {
            *self.stack.get() = (*top).prev;
        }
        top
    }

    /// Commits the top segment, recording how many slots were filled since
    /// it was installed. `pending_write` marks the segment as no longer
    /// primed when a fault is what triggered the commit (a fresh segment
    /// will be primed and pushed in its place).
    fn commit(&self, pending_write: bool) {
        let top = self.back();
        debug_assert!(!top.is_null());

        // SAFETY: `top` is attached to this barrier and only this thread or
        // the fault handler (serialized with us by the trap itself) touches it.
        unsafe {
            if pending_write {
                (*top).primed = false;
            }

            match self.phase() {
                WriteBarrierPhase::StoreIncrements => {
                    let first = (*top).cursor();
                    let last = (*self.increment_cursor).load(Ordering::Acquire);
                    (*top).increment_count = last.offset_from(first) as usize;
                }
                WriteBarrierPhase::StoreDecrements => {
                    let first = (*top).cursor();
                    let last = (*self.decrement_cursor).load(Ordering::Acquire);
                    (*top).decrement_count = last.offset_from(first) as usize;
                }
                _ => crate::protocol_violation!("commit called on a barrier that is neither store-phase"),
            }
        }
    }

    /// Walks every segment currently stacked on this barrier (most recently
    /// pushed first), invoking `visit` on each committed segment, then pops
    /// and recycles all of them back to `manager`. Leaves the barrier empty
    /// — a fresh segment must be pushed before any further writes target it.
    pub(crate) fn drain(&self, manager: &WriteBarrierManager, mut visit: impl FnMut(&WriteBarrierSegment)) {
        loop {
            let top = self.pop_back();
            if top.is_null() {
                break;
            }
            // SAFETY: `top` was committed (via `commit`) before draining
            // began; its `increment_count`/`decrement_count` are final.
            visit(unsafe { &*top });
            manager.deallocate_segment(top);
        }
    }
}

/// Allocates, primes, and recycles [`WriteBarrierSegment`]s, and owns the
/// [`PageFaultHandler`] that services guard-page traps for every ledger.
pub struct WriteBarrierManager {
    page_fault_handler: PageFaultHandler,
    segment_capacity: usize,
    pool: Mutex<Vec<Box<WriteBarrierSegment>>>,
}

// SAFETY: the pool's raw `prev`/`barrier` links are only ever read or
// written by whichever thread currently holds the pool mutex (`allocate_segment`/
// `deallocate_segment`) or owns the segment's attached barrier (serialized
// by the guard-page trap itself, as on `WriteBarrier`). The manager itself
// is shared (via `Arc`) between the domain thread and every region thread
// so each can attach/detach its own ledger.
unsafe impl Send for WriteBarrierManager {}
unsafe impl Sync for WriteBarrierManager {}

impl WriteBarrierManager {
    /// # Errors
    /// Returns [`crate::error::MantleError::PageFaultHandlerUnavailable`] if
    /// `userfaultfd` cannot be created (see [`crate::fallback`] for a
    /// non-Linux or unprivileged substitute).
    pub fn new(segment_capacity: usize) -> Result<Self, crate::error::MantleError> {
        Ok(Self {
            page_fault_handler: PageFaultHandler::new()?,
            segment_capacity,
            pool: Mutex::new(Vec::new()),
        })
    }

    /// The page-fault handler's fd, for registration with a
    /// [`crate::selector::Selector`].
    #[must_use]
    pub fn file_descriptor(&self) -> std::os::fd::RawFd {
        self.page_fault_handler.file_descriptor()
    }

    /// Services every currently queued fault: commits the segment that
    /// trapped, installs a fresh one in its place, and unprotects the
    /// faulted page so the stalled write can complete.
    pub fn poll(&self) {
        for event in self.page_fault_handler.drain_events() {
            if !event.write_protect {
                crate::protocol_violation!("unexpected non-write-protect fault at {:#x}", event.address);
            }

            let page_start = (event.address / PAGE_SIZE) * PAGE_SIZE;
            // SAFETY: the guard page always begins with a stamped segment
            // pointer, written by `prime_guard_page` before the page was
            // armed.
            let prev_segment = unsafe {
                let mut raw: usize = 0;
                std::ptr::copy_nonoverlapping(
                    page_start as *const u8,
                    std::ptr::addr_of_mut!(raw).cast::<u8>(),
                    std::mem::size_of::<usize>(),
                );
                raw as *mut WriteBarrierSegment
            };

            // SAFETY: `prev_segment` is attached to a live barrier.
            let barrier = unsafe { &*(*prev_segment).barrier };
            barrier.commit(true);

            let next_segment = self.allocate_segment();
            barrier.push_back(next_segment);

            // SAFETY: `prev_segment` is still a valid, now-committed segment.
            let guard_page = unsafe { (*prev_segment).guard_page() };
            self.page_fault_handler.write_unprotect_memory(guard_page);
        }
    }

    /// Pushes one freshly primed segment onto `barrier`. Called once per
    /// barrier when a ledger is built, and again by the region controller
    /// after draining a barrier so it's ready the next time its role
    /// rotates back to a store phase.
    pub(crate) fn attach(&self, barrier: &WriteBarrier) {
        let segment = self.allocate_segment();
        barrier.push_back(segment);
    }

    fn detach(&self, barrier: &WriteBarrier) {
        loop {
            let segment = barrier.pop_back();
            if segment.is_null() {
                break;
            }
            self.deallocate_segment(segment);
        }
    }

    fn allocate_segment(&self) -> *mut WriteBarrierSegment {
        let mut pool = self.pool.lock().expect("segment pool mutex poisoned");
        let mut segment = match pool.pop() {
            Some(segment) => segment,
            None => {
                let segment = Box::new(WriteBarrierSegment::new(self.segment_capacity));
                self.page_fault_handler
                    .register_memory(segment.guard_page(), &[FaultMode::WriteProtect]);
                segment
            }
        };
        self.prime_guard_page(&mut segment);
        Box::into_raw(segment)
    }

    fn deallocate_segment(&self, segment: *mut WriteBarrierSegment) {
        // SAFETY: `segment` was produced by `allocate_segment`'s
        // `Box::into_raw` and the caller (`detach`) is handing back
        // ownership after popping it off its barrier.
        let mut segment = unsafe { Box::from_raw(segment) };
        segment.barrier = std::ptr::null_mut();
        segment.prev = std::ptr::null_mut();
        segment.increment_count = 0;
        segment.decrement_count = 0;
        self.pool.lock().expect("segment pool mutex poisoned").push(segment);
    }

    fn prime_guard_page(&self, segment: &mut WriteBarrierSegment) {
        if segment.primed {
            return;
        }
        let segment_address = std::ptr::from_mut(segment) as usize;
        let guard_page = segment.guard_page_mut();
        guard_page[..std::mem::size_of::<usize>()].copy_from_slice(&segment_address.to_ne_bytes());

        self.page_fault_handler.write_protect_memory(segment.guard_page());
        segment.primed = true;
    }
}

/// Owns the four rotating barriers for one region's pending operations.
pub struct Ledger {
    sequence: AtomicU64,
    increment_cursor: AtomicPtr<*mut Object>,
    decrement_cursor: AtomicPtr<*mut Object>,
    barriers: [Box<WriteBarrier>; WRITE_BARRIER_PHASE_COUNT],
}

impl Ledger {
    /// Builds a ledger and attaches one freshly primed segment to each of
    /// its four barriers via `manager`.
    #[must_use]
    pub fn new(manager: &WriteBarrierManager) -> Box<Self> {
        let sequence = AtomicU64::new(0);
        let increment_cursor = AtomicPtr::new(std::ptr::null_mut());
        let decrement_cursor = AtomicPtr::new(std::ptr::null_mut());

        let mut ledger = Box::new(Self {
            sequence,
            increment_cursor,
            decrement_cursor,
            barriers: std::array::from_fn(|_| {
                Box::new(WriteBarrier {
                    phase_shift: 0,
                    sequence: std::ptr::null(),
                    stack: UnsafeCell::new(std::ptr::null_mut()),
                    increment_cursor: std::ptr::null(),
                    decrement_cursor: std::ptr::null(),
                })
            }),
        });

        for (shift, barrier) in ledger.barriers.iter_mut().enumerate() {
            barrier.phase_shift = shift as u64;
            barrier.sequence = std::ptr::addr_of!(ledger.sequence);
            barrier.increment_cursor = std::ptr::addr_of!(ledger.increment_cursor);
            barrier.decrement_cursor = std::ptr::addr_of!(ledger.decrement_cursor);
        }

        for barrier in &ledger.barriers {
            manager.attach(barrier);
        }

        ledger
    }

    /// Detaches and recycles every segment still attached to this ledger's
    /// barriers. Must be called before the ledger is dropped.
    pub fn detach(&self, manager: &WriteBarrierManager) {
        for barrier in &self.barriers {
            manager.detach(barrier);
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn increment_cursor(&self) -> *mut *mut Object {
        self.increment_cursor.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn decrement_cursor(&self) -> *mut *mut Object {
        self.decrement_cursor.load(Ordering::Acquire)
    }

    fn barrier(&self, phase: WriteBarrierPhase) -> &WriteBarrier {
        let sequence = self.sequence.load(Ordering::Acquire);
        let index = (phase as u64).wrapping_sub(sequence) % WRITE_BARRIER_PHASE_COUNT as u64;
        let barrier = &self.barriers[index as usize];
        debug_assert_eq!(barrier.phase(), phase);
        barrier
    }

    #[must_use]
    pub fn increment_barrier(&self) -> &WriteBarrier {
        self.barrier(WriteBarrierPhase::StoreIncrements)
    }

    #[must_use]
    pub fn decrement_barrier(&self) -> &WriteBarrier {
        self.barrier(WriteBarrierPhase::StoreDecrements)
    }

    /// Logs an increment of `object`'s reference count. Called only by the
    /// region thread that owns this ledger.
    ///
    /// The write lands on whatever slot the shared increment cursor
    /// currently points at. If that slot is a segment's guard page, the
    /// kernel stalls this thread until the domain's
    /// [`WriteBarrierManager::poll`] services the fault and unprotects the
    /// page underneath it — the write then completes as if nothing
    /// happened. No explicit synchronization is needed on the region side.
    pub fn write_increment(&self, object: *mut Object) {
        self.write(&self.increment_cursor, object);
    }

    /// Logs a decrement of `object`'s reference count. See
    /// [`Ledger::write_increment`] for the blocking behavior at a segment
    /// boundary.
    pub fn write_decrement(&self, object: *mut Object) {
        self.write(&self.decrement_cursor, object);
    }

    fn write(&self, cursor: &AtomicPtr<*mut Object>, object: *mut Object) {
        let slot = cursor.load(Ordering::Acquire);
        // SAFETY: `slot` points into a live, primed segment's mapped pointer
        // slots (or its guard page, in which case the kernel blocks this
        // write until the page fault is serviced and the slot is replaced by
        // a fresh segment's first slot).
        unsafe {
            slot.write(object);
        }
        let next = slot.wrapping_add(1);
        cursor.store(next, Ordering::Release);
    }

    /// Commits both store-phase barriers, advances the sequence, and
    /// republishes the cursor slots to point inside the now-active segments.
    pub fn step(&self) {
        self.increment_barrier().commit(false);
        self.decrement_barrier().commit(false);

        let previous_sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        crate::invariants::debug_assert_monotonic!("ledger sequence", previous_sequence, previous_sequence + 1);

        // SAFETY: each store-phase barrier always has a segment on top once
        // the ledger is attached.
        let increment_top = unsafe { (*self.increment_barrier().back()).cursor() };
        let decrement_top = unsafe { (*self.decrement_barrier().back()).cursor() };
        self.increment_cursor.store(increment_top, Ordering::Release);
        self.decrement_cursor.store(decrement_top, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_rotates_with_sequence() {
        assert_eq!(WriteBarrierPhase::from_u64(0), WriteBarrierPhase::StoreDecrements);
        assert_eq!(WriteBarrierPhase::from_u64(1), WriteBarrierPhase::Wait);
        assert_eq!(WriteBarrierPhase::from_u64(2), WriteBarrierPhase::StoreIncrements);
        assert_eq!(WriteBarrierPhase::from_u64(3), WriteBarrierPhase::Sync);
        assert_eq!(WriteBarrierPhase::from_u64(4), WriteBarrierPhase::StoreDecrements);
    }
}
