//! The host-supplied capability that releases an object's memory once its
//! reference count reaches zero.
//!
//! The original's per-object `ObjectFinalizer::finalize(Object&)` is ported
//! here as a batched interface driven by one call per
//! [`crate::object_grouper::ObjectGroups`] group: the group tag is already
//! known to the caller, so a finalizer that only has one concrete type per
//! group never needs to branch on it per object.

use crate::object::{Object, ObjectGroup};

/// Releases dead objects. Implementations decide what "release" means
/// (return to a pool, call a destructor, free); the core never touches an
/// object's memory again after handing it to a finalizer.
///
/// # Safety
/// Every pointer in `objects` is guaranteed dead (its count reached zero)
/// and unmanaged (its region id has been cleared) at the time this is
/// called, but the memory itself is only as valid as whatever allocated it
/// — implementations are responsible for knowing what layout `group`
/// implies.
pub trait Finalizer: Send {
    /// Finalizes every object in one group. Called once per non-empty group
    /// per cycle, in ascending group order.
    ///
    /// # Safety
    /// Every pointer in `objects` must not be dereferenced after this call
    /// returns; ownership passes to the finalizer for the duration of the
    /// call only.
    unsafe fn finalize(&mut self, group: ObjectGroup, objects: &[*mut Object]);
}

/// A finalizer built from a closure, for tests and simple hosts that don't
/// need a dedicated type per finalizer.
pub struct FnFinalizer<F>(F)
where
    F: FnMut(ObjectGroup, &[*mut Object]) + Send;

impl<F> FnFinalizer<F>
where
    F: FnMut(ObjectGroup, &[*mut Object]) + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Finalizer for FnFinalizer<F>
where
    F: FnMut(ObjectGroup, &[*mut Object]) + Send,
{
    unsafe fn finalize(&mut self, group: ObjectGroup, objects: &[*mut Object]) {
        (self.0)(group, objects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn closure_finalizer_observes_group_and_count() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let mut finalizer = FnFinalizer::new(move |_group, objects| {
            seen_clone.fetch_add(objects.len(), Ordering::Relaxed);
        });

        let object = Box::into_raw(Box::new(Object::new(1)));
        unsafe {
            finalizer.finalize(1, &[object]);
            drop(Box::from_raw(object));
        }
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
