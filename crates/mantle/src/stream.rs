//! A lock-free, single-producer/single-consumer ring of messages.
//!
//! Grounded on the upstream `Ring<T>` (cache-line-aligned head/tail, a
//! locally cached copy of the other side's cursor to avoid a cross-core
//! atomic load on every operation, Acquire/Release handoff) but trimmed to
//! what [`crate::connection::Connection`] needs: publish one message at a
//! time, drain many at once. Capacity is fixed at construction and is
//! [`crate::config::STREAM_CAPACITY`] everywhere except tests, which use
//! small capacities to exercise the full/empty boundaries.

use crate::message::Message;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-capacity SPSC ring of `Message`.
///
/// `send` is called only by the owning endpoint's peer (see
/// [`crate::connection::Connection`]); `receive` only by the endpoint's own
/// thread. Capacity must be a power of two.
pub struct Stream {
    tail: CachePadded<AtomicU64>,
    cached_head: CachePadded<UnsafeCell<u64>>,
    head: CachePadded<AtomicU64>,
    cached_tail: CachePadded<UnsafeCell<u64>>,
    buffer: UnsafeCell<Box<[MaybeUninit<Message>]>>,
    mask: u64,
}

// SAFETY: access to `buffer` is split by construction — the producer only
// ever touches slots in `[tail, tail + capacity)` that the consumer has
// already vacated, and vice versa; the cached cursors are each written by
// exactly one side.
unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Stream {
    /// Builds an empty stream with room for `capacity` messages.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "stream capacity must be a power of two");

        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, MaybeUninit::uninit);

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(UnsafeCell::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(UnsafeCell::new(0)),
            buffer: UnsafeCell::new(buffer.into_boxed_slice()),
            mask: capacity as u64 - 1,
        }
    }

    /// Slot capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    fn index(&self, sequence: u64) -> usize {
        (sequence & self.mask) as usize
    }

    /// Publishes one message. Returns `false` (without touching anything)
    /// if the stream is full — the spec treats this as a protocol
    /// violation the caller must not retry blindly.
    pub fn send(&self, message: Message) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);

        // SAFETY: only the producer writes `cached_head`.
        let mut cached_head = unsafe { *self.cached_head.get() };
        if tail - cached_head >= self.capacity() {
            cached_head = self.head.load(Ordering::Acquire);
            unsafe {
                *self.cached_head.get() = cached_head;
            }
            if tail - cached_head >= self.capacity() {
                return false;
            }
        }

        let index = self.index(tail);
        // SAFETY: slot `index` was vacated by the consumer before it
        // advanced `head` past `tail - capacity`.
        unsafe {
            (*self.buffer.get())[index].write(message);
        }

        self.tail.store(tail + 1, Ordering::Release);
        true
    }

    /// Drains every currently available message into `out`, returning the
    /// count drained. Never blocks; callers that want to wait poll the
    /// connection's doorbell first.
    pub fn receive_into(&self, out: &mut Vec<Message>) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let available = tail - head;
        if available == 0 {
            return 0;
        }

        for offset in 0..available {
            let sequence = head + offset;
            let index = self.index(sequence);
            // SAFETY: slots in `[head, tail)` were published by the
            // producer's `Release` store above and are not re-read once
            // `head` advances past them.
            let message = unsafe { (*self.buffer.get())[index].assume_init_read() };
            out.push(message);
        }

        self.head.store(head + available, Ordering::Release);
        available as usize
    }

    /// Number of messages currently queued.
    #[must_use]
    pub fn len(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail - head
    }

    /// Whether the stream currently has no queued messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for sequence in head..tail {
            let index = self.index(sequence);
            // SAFETY: these slots were published but never drained; drop
            // them so their contents don't leak.
            unsafe {
                (*self.buffer.get())[index].assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_receive_round_trips() {
        let stream = Stream::new(4);
        assert!(stream.send(Message::Start));
        assert!(stream.send(Message::Leave { stop: true }));

        let mut out = Vec::new();
        assert_eq!(stream.receive_into(&mut out), 2);
        assert!(matches!(out[0], Message::Start));
        assert!(matches!(out[1], Message::Leave { stop: true }));
    }

    #[test]
    fn full_stream_rejects_send() {
        let stream = Stream::new(2);
        assert!(stream.send(Message::Start));
        assert!(stream.send(Message::Start));
        assert!(!stream.send(Message::Start));
    }

    #[test]
    fn capacity_4096_holds_exactly_4096_then_rejects() {
        let stream = Stream::new(crate::config::STREAM_CAPACITY);
        for _ in 0..crate::config::STREAM_CAPACITY {
            assert!(stream.send(Message::Start));
        }
        assert!(!stream.send(Message::Start));
    }
}
