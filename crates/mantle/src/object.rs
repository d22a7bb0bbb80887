//! The base entity whose lifetime the runtime tracks.
//!
//! `Object` itself carries no behavior beyond the count/region/group
//! bookkeeping; everything else (how it's allocated, what "finalize" means)
//! is a decision for the host via the [`crate::finalizer::Finalizer`]
//! capability.

use crate::config::INVALID_REGION_ID;
use std::sync::atomic::{AtomicU16, Ordering};

/// A user-assigned tag used only to batch finalization; semantics are
/// entirely up to the host (commonly "the object's concrete type").
pub type ObjectGroup = u16;

/// The id of the region whose controller owns an object's count.
pub type RegionId = u16;

/// Matches `Object`'s `repr(align(16))` — the number of low pointer bits
/// guaranteed zero, shared by [`crate::operation::Operation`]'s tag and
/// [`crate::object_cache::ObjectCache`]'s set derivation.
pub const OBJECT_ALIGNMENT: usize = 16;

/// Base entity tracked by the runtime.
///
/// `#[repr(align(16))]` guarantees the low four bits of any `*const Object`
/// / `*mut Object` are zero, which [`crate::operation::Operation`] relies on
/// to steal those bits for its sign/exponent tag.
///
/// The reference count is intentionally non-atomic: by [`I2`] it is
/// mutated only by the owning controller, and only during the apply step of
/// a cycle, so no other thread ever races on it. `region_id` is stored
/// atomically only so that a region may safely *read* it (to decide where
/// to route an operation) while the owning controller concurrently clears
/// it at finalization — a plain load/store pair, not a read-modify-write.
///
/// [`I2`]: crate#invariants
#[repr(align(16))]
pub struct Object {
    reference_count: u32,
    region_id: AtomicU16,
    group: ObjectGroup,
}

impl Object {
    /// Constructs an unmanaged object with the given group tag.
    #[must_use]
    pub fn new(group: ObjectGroup) -> Self {
        Self {
            reference_count: 0,
            region_id: AtomicU16::new(INVALID_REGION_ID),
            group,
        }
    }

    /// Whether the object has been bound to a region.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.region_id() != INVALID_REGION_ID
    }

    /// The owning region's id, or [`INVALID_REGION_ID`] if unmanaged.
    #[must_use]
    pub fn region_id(&self) -> RegionId {
        self.region_id.load(Ordering::Acquire)
    }

    /// The object's group tag.
    #[must_use]
    pub fn group(&self) -> ObjectGroup {
        self.group
    }

    /// Binds the object to `region_id`. Called once, by whichever region
    /// forms the object's first handle.
    ///
    /// # Panics
    /// Panics if the object is already bound — double-binding is a
    /// protocol violation in the handle layer.
    pub fn bind(&self, region_id: RegionId) {
        let previous = self.region_id.swap(region_id, Ordering::AcqRel);
        if previous != INVALID_REGION_ID {
            crate::protocol_violation!("object bound twice (already owned by region {previous})");
        }
    }

    /// Applies an increment of `magnitude`. Always succeeds.
    ///
    /// # Safety
    /// Must only be called by the object's owning controller, during the
    /// apply step of a cycle (`I2`). Requires `&mut self` — the caller must
    /// hold the only reference at apply time, which the controller's
    /// single-threaded apply loop guarantees.
    pub fn apply_increment(&mut self, magnitude: u32) {
        self.reference_count = self.reference_count.saturating_add(magnitude);
    }

    /// Applies a decrement of `magnitude`.
    ///
    /// Returns `true` if the object is still alive, `false` if the count
    /// fell to (or was clamped to) zero. On death, `region_id` is cleared
    /// back to [`INVALID_REGION_ID`] so a stray handle drop afterward can't
    /// route to a controller that no longer owns the count.
    ///
    /// Over-decrement (requesting more than the live count) clamps to zero
    /// rather than wrapping, so a handle-layer bug surfaces as premature
    /// finalization instead of a count of `u32::MAX`.
    pub fn apply_decrement(&mut self, magnitude: u32) -> bool {
        if self.reference_count < magnitude {
            debug_assert!(
                self.reference_count == magnitude,
                "over-decrement: count {} < decrement magnitude {magnitude}",
                self.reference_count
            );
            self.reference_count = 0;
            self.region_id.store(INVALID_REGION_ID, Ordering::Release);
            false
        } else {
            self.reference_count -= magnitude;
            if self.reference_count == 0 {
                self.region_id.store(INVALID_REGION_ID, Ordering::Release);
                false
            } else {
                true
            }
        }
    }

    /// The current reference count. Exposed for tests and metrics; reading
    /// it from outside the owning controller during a live cycle races with
    /// the apply step and is only meaningful after a full barrier.
    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unmanaged() {
        let obj = Object::new(7);
        assert!(!obj.is_managed());
        assert_eq!(obj.group(), 7);
    }

    #[test]
    fn bind_sets_region_id() {
        let obj = Object::new(0);
        obj.bind(3);
        assert!(obj.is_managed());
        assert_eq!(obj.region_id(), 3);
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn double_bind_is_a_protocol_violation() {
        let obj = Object::new(0);
        obj.bind(1);
        obj.bind(2);
    }

    #[test]
    fn increment_then_decrement_to_zero_reports_death() {
        let mut obj = Object::new(0);
        obj.bind(0);
        obj.apply_increment(2);
        assert_eq!(obj.reference_count(), 2);
        assert!(obj.apply_decrement(1));
        assert!(!obj.apply_decrement(1));
        assert!(!obj.is_managed());
    }

    #[test]
    fn over_decrement_clamps_to_zero() {
        let mut obj = Object::new(0);
        obj.bind(0);
        obj.apply_increment(1);
        assert!(!obj.apply_decrement(5));
        assert_eq!(obj.reference_count(), 0);
        assert!(!obj.is_managed());
    }
}
