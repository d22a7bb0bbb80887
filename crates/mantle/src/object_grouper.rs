//! Batches objects that just died by their group tag, in O(n), for
//! amortized finalization.
//!
//! Grounded on the original `ObjectGrouper`
//! (`include/mantle/object_grouper.h`): a two-pass counting sort. The first
//! pass counts objects per group and turns those counts into cumulative
//! offsets; the second pass places each object directly into its bucket by
//! walking the offsets backward, which needs no comparisons and no extra
//! allocation beyond the output buffer.

use crate::object::{Object, ObjectGroup};

/// Counters mirroring the original's `ObjectGrouperMetrics`.
#[derive(Debug, Clone, Copy)]
pub struct ObjectGrouperMetrics {
    pub object_count: u64,
    pub group_min: ObjectGroup,
    pub group_max: ObjectGroup,
}

impl Default for ObjectGrouperMetrics {
    fn default() -> Self {
        Self {
            object_count: 0,
            group_min: ObjectGroup::MAX,
            group_max: ObjectGroup::MIN,
        }
    }
}

/// The result of one [`ObjectGrouper::flush`]: every object handed in since
/// the last flush, partitioned by group and ready for the
/// [`crate::finalizer::Finalizer`] to walk group-by-group.
#[derive(Debug, Default)]
pub struct ObjectGroups {
    objects: Vec<*mut Object>,
    group_offsets: Vec<usize>,
    group_min: ObjectGroup,
    group_max: ObjectGroup,
    grouping_enabled: bool,
}

impl ObjectGroups {
    /// All dead objects, ungrouped.
    #[must_use]
    pub fn objects(&self) -> &[*mut Object] {
        &self.objects
    }

    /// True if there is at least one object to finalize.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The members of `group`, or an empty slice if grouping is disabled or
    /// the group is empty.
    #[must_use]
    pub fn group_members(&self, group: ObjectGroup) -> &[*mut Object] {
        if !self.grouping_enabled || self.objects.is_empty() || group < self.group_min || group > self.group_max {
            return &[];
        }
        let start = self.group_offsets[group as usize];
        let end = self.group_offsets[group as usize + 1];
        &self.objects[start..end]
    }

    /// The inclusive range of groups present, if any. `None` both when
    /// there are no objects and when grouping is disabled (in which case
    /// [`Self::objects`] is the only way to reach them).
    #[must_use]
    pub fn group_range(&self) -> Option<(ObjectGroup, ObjectGroup)> {
        (self.grouping_enabled && !self.objects.is_empty()).then_some((self.group_min, self.group_max))
    }
}

/// Accumulates dead objects across a cycle's apply step, then buckets them
/// by group tag on [`Self::flush`].
pub struct ObjectGrouper {
    grouping_enabled: bool,
    input: Vec<*mut Object>,
    group_buckets: Vec<usize>,
    group_min: ObjectGroup,
    group_max: ObjectGroup,
    metrics: ObjectGrouperMetrics,
}

impl ObjectGrouper {
    #[must_use]
    pub fn new(grouping_enabled: bool) -> Self {
        Self {
            grouping_enabled,
            input: Vec::new(),
            group_buckets: vec![0; ObjectGroup::MAX as usize + 1],
            group_min: ObjectGroup::MAX,
            group_max: ObjectGroup::MIN,
            metrics: ObjectGrouperMetrics::default(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &ObjectGrouperMetrics {
        &self.metrics
    }

    /// Records one dead object, reading its group tag.
    ///
    /// # Safety
    /// `object` must point at a live `Object` (its count may already be
    /// zero, but the memory must not yet have been released).
    pub unsafe fn write(&mut self, object: *mut Object) {
        // SAFETY: caller's contract.
        let group = unsafe { (*object).group() };

        self.group_buckets[group as usize] += 1;
        self.group_min = self.group_min.min(group);
        self.group_max = self.group_max.max(group);

        self.input.push(object);
    }

    /// Buckets every object recorded since the last flush and returns the
    /// result, resetting internal state for the next cycle.
    pub fn flush(&mut self) -> ObjectGroups {
        self.metrics.object_count += self.input.len() as u64;
        if !self.input.is_empty() {
            self.metrics.group_min = self.metrics.group_min.min(self.group_min);
            self.metrics.group_max = self.metrics.group_max.max(self.group_max);
        }

        let groups = if self.grouping_enabled && !self.input.is_empty() {
            let mut group_offsets = vec![0usize; ObjectGroup::MAX as usize + 2];

            let mut offset = 0;
            for group in self.group_min..=self.group_max {
                let group_size = self.group_buckets[group as usize];
                group_offsets[group as usize] = offset;
                offset += group_size;
            }
            debug_assert_eq!(offset, self.input.len());
            group_offsets[self.group_max as usize + 1] = offset;

            let mut output = vec![std::ptr::null_mut(); self.input.len()];
            for &object in &self.input {
                // SAFETY: `object` was written via `write`'s own safety contract.
                let group = unsafe { (*object).group() };
                let bucket = &mut self.group_buckets[group as usize];
                debug_assert!(*bucket > 0);
                *bucket -= 1;
                output[group_offsets[group as usize] + *bucket] = object;
            }

            ObjectGroups {
                objects: output,
                group_offsets,
                group_min: self.group_min,
                group_max: self.group_max,
                grouping_enabled: true,
            }
        } else {
            ObjectGroups {
                objects: std::mem::take(&mut self.input),
                group_offsets: Vec::new(),
                group_min: self.group_min,
                group_max: self.group_max,
                grouping_enabled: false,
            }
        };

        self.input.clear();
        self.group_min = ObjectGroup::MAX;
        self.group_max = ObjectGroup::MIN;
        self.group_buckets.fill(0);

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_with_group(group: ObjectGroup) -> *mut Object {
        Box::into_raw(Box::new(Object::new(group)))
    }

    #[test]
    fn groups_objects_by_tag() {
        let mut grouper = ObjectGrouper::new(true);
        let a = object_with_group(2);
        let b = object_with_group(1);
        let c = object_with_group(2);

        unsafe {
            grouper.write(a);
            grouper.write(b);
            grouper.write(c);
        }

        let groups = grouper.flush();
        assert_eq!(groups.group_members(1), &[b]);
        assert_eq!(groups.group_members(2).len(), 2);
        assert!(groups.group_members(2).contains(&a));
        assert!(groups.group_members(2).contains(&c));

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }

    #[test]
    fn disabled_grouping_returns_ungrouped_objects() {
        let mut grouper = ObjectGrouper::new(false);
        let a = object_with_group(5);
        unsafe {
            grouper.write(a);
        }
        let groups = grouper.flush();
        assert_eq!(groups.objects(), &[a]);
        assert!(groups.group_members(5).is_empty());

        unsafe {
            drop(Box::from_raw(a));
        }
    }
}
