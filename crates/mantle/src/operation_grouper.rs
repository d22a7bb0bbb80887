//! Merges repeated increments/decrements on the same object into a single
//! net delta before it reaches the controller's apply step.
//!
//! Grounded on the original `OperationGrouper`
//! (`include/mantle/operation_grouper.h`, `src/operation_grouper.cpp`): a
//! set-associative cache of `(object, net delta, hit count, hit decay)`
//! entries. A group survives eviction longer the more it's hit (an
//! exponential hit-decay counter), so hot objects stay netted across many
//! cycles instead of round-tripping through the apply step every time.

use crate::object::Object;
use crate::object_cache::{Cursor, Entry, ObjectCache};
use crate::operation::{Operation, OperationType};

/// Net delta plus eviction-resistance bookkeeping for one cached object.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct OperationGroup {
    delta: i64,
    hit_count: u64,
    hit_decay: u64,
}

/// Counters mirroring the original's `OperationGrouperMetrics`, useful for
/// diagnosing grouper effectiveness under load.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationGrouperMetrics {
    pub grouped_count: u64,
    pub written_count: u64,
    pub written_increment_count: u64,
    pub written_decrement_count: u64,
    pub flushed_count: u64,
    pub flushed_increment_count: u64,
    pub flushed_decrement_count: u64,
}

/// Merges a stream of [`Operation`]s into per-object net deltas.
pub struct OperationGrouper {
    increments: Vec<(*mut Object, i64)>,
    decrements: Vec<(*mut Object, i64)>,
    cache_size: usize,
    metrics: OperationGrouperMetrics,
    cache: ObjectCache<OperationGroup>,
}

impl OperationGrouper {
    #[must_use]
    pub fn new(cache_size: usize, cache_ways: usize) -> Self {
        Self {
            increments: Vec::new(),
            decrements: Vec::new(),
            cache_size: 0,
            metrics: OperationGrouperMetrics::default(),
            cache: ObjectCache::new(cache_size, cache_ways),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &OperationGrouperMetrics {
        &self.metrics
    }

    /// True if any operations remain cached rather than flushed to
    /// [`Self::increments`]/[`Self::decrements`].
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.cache_size > 0
    }

    #[must_use]
    pub fn increments(&self) -> &[(*mut Object, i64)] {
        &self.increments
    }

    #[must_use]
    pub fn decrements(&self) -> &[(*mut Object, i64)] {
        &self.decrements
    }

    /// Writes one operation. With `flush == true`, the cache is bypassed
    /// entirely and the operation's value is appended straight to the
    /// increment/decrement collection — used for operations the caller
    /// already knows won't recur (e.g. the tail of a barrier walk).
    pub fn write(&mut self, operation: Operation, flush: bool) {
        let Some(object) = operation.object() else {
            return;
        };

        if flush {
            match operation.op_type() {
                OperationType::Increment => self.increments.push((object, operation.value())),
                OperationType::Decrement => self.decrements.push((object, operation.value())),
            }
            return;
        }

        let cursor = self.choose_way(object);
        let entry = self.cache.load(cursor);

        if entry.key == Some(object) {
            let mut group = entry.val;
            let input_sum = group.delta + operation.value();
            group.delta = input_sum;
            crate::invariants::debug_assert_netting_conserved!(input_sum, group.delta);
            group.hit_count += 1;
            if group.delta != 0 {
                self.cache.store(cursor, Entry { key: Some(object), val: group });
            } else {
                self.cache.reset(cursor);
                self.cache_size -= 1;
            }
        } else if entry.key.is_some() {
            self.flush_group(cursor, true);
            self.cache.store(
                cursor,
                Entry {
                    key: Some(object),
                    val: OperationGroup { delta: operation.value(), hit_count: 0, hit_decay: 1 },
                },
            );
            self.cache_size += 1;
        } else {
            self.cache.store(
                cursor,
                Entry {
                    key: Some(object),
                    val: OperationGroup { delta: operation.value(), hit_count: 0, hit_decay: 1 },
                },
            );
            self.cache_size += 1;
        }

        self.note_operation_written(operation.op_type());
    }

    /// Flushes every cached group to the increment/decrement collections.
    /// With `force == false`, groups with enough recent hits survive.
    pub fn flush(&mut self, force: bool) {
        let mut cursor = self.cache.first();
        loop {
            self.flush_group(cursor, force);
            match self.cache.next(cursor) {
                Some(next) => cursor = next,
                None => break,
            }
        }
    }

    /// Clears the increment/decrement collections (but not the cache).
    pub fn clear(&mut self) {
        self.increments.clear();
        self.decrements.clear();
    }

    /// Clears the increment/decrement collections and every cached group.
    pub fn reset(&mut self) {
        let mut cursor = self.cache.first();
        loop {
            self.reset_group(cursor);
            match self.cache.next(cursor) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        debug_assert_eq!(self.cache_size, 0);
        self.clear();
    }

    fn choose_way(&self, object: *mut Object) -> Cursor {
        let (first, last) = self.cache.equal_range(object);

        let mut cursor = first;
        loop {
            if self.cache.load(cursor).key == Some(object) {
                return cursor;
            }
            if cursor == last {
                break;
            }
            let Some(next) = self.cache.next(cursor) else { break };
            if next == last {
                break;
            }
            cursor = next;
        }

        let mut cursor = first;
        loop {
            if self.cache.load(cursor).key.is_none() {
                return cursor;
            }
            let Some(next) = self.cache.next(cursor) else { break };
            if next == last {
                break;
            }
            cursor = next;
        }

        let mut min_cursor = first;
        let mut min_magnitude = i64::MAX;
        let mut cursor = first;
        loop {
            let entry = self.cache.load(cursor);
            let magnitude = entry.val.delta.abs();
            if magnitude < min_magnitude {
                min_magnitude = magnitude;
                min_cursor = cursor;
            }
            let Some(next) = self.cache.next(cursor) else { break };
            if next == last {
                break;
            }
            cursor = next;
        }
        min_cursor
    }

    fn flush_group(&mut self, cursor: Cursor, force: bool) {
        let entry = self.cache.load(cursor);
        let Some(key) = entry.key else { return };

        let mut group = entry.val;
        group.hit_decay = group.hit_decay.saturating_mul(2);
        if group.hit_decay < group.hit_count && !force {
            self.cache.store(cursor, Entry { key: Some(key), val: group });
            return;
        }

        if group.delta >= 0 {
            self.increments.push((key, group.delta));
        } else {
            self.decrements.push((key, group.delta));
        }
        self.metrics.flushed_count += 1;
        if group.delta >= 0 {
            self.metrics.flushed_increment_count += 1;
        } else {
            self.metrics.flushed_decrement_count += 1;
        }

        self.reset_group(cursor);
    }

    fn reset_group(&mut self, cursor: Cursor) {
        if self.cache.load(cursor).key.is_some() {
            debug_assert!(self.cache_size > 0);
            self.cache.reset(cursor);
            self.cache_size -= 1;
        }
    }

    fn note_operation_written(&mut self, op_type: OperationType) {
        self.metrics.written_count += 1;
        match op_type {
            OperationType::Increment => self.metrics.written_increment_count += 1,
            OperationType::Decrement => self.metrics.written_decrement_count += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_at(addr: usize) -> *mut Object {
        addr as *mut Object
    }

    #[test]
    fn repeated_increments_on_one_object_net_together() {
        let mut grouper = OperationGrouper::new(16, 4);
        let obj = object_at(0x1000);
        grouper.write(Operation::increment(obj, 0), false);
        grouper.write(Operation::increment(obj, 0), false);
        grouper.flush(true);

        assert_eq!(grouper.increments(), &[(obj, 2)]);
        assert!(grouper.decrements().is_empty());
    }

    #[test]
    fn increment_then_decrement_cancels_to_nothing() {
        let mut grouper = OperationGrouper::new(16, 4);
        let obj = object_at(0x2000);
        grouper.write(Operation::increment(obj, 0), false);
        grouper.write(Operation::decrement(obj, 0), false);
        grouper.flush(true);

        assert!(grouper.increments().is_empty());
        assert!(grouper.decrements().is_empty());
        assert!(!grouper.is_dirty());
    }

    #[test]
    fn flush_bypass_skips_the_cache() {
        let mut grouper = OperationGrouper::new(16, 4);
        let obj = object_at(0x3000);
        grouper.write(Operation::increment(obj, 2), true);
        assert_eq!(grouper.increments(), &[(obj, 4)]);
        assert!(!grouper.is_dirty());
    }
}
