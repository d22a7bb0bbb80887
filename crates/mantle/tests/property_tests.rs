//! Property-based coverage of the two grouping caches, mirroring the
//! teacher's `property_tests.rs`: one invariant per `proptest!` block
//! instead of a handful of hand-picked examples.

use mantle::object::{Object, ObjectGroup};
use mantle::object_grouper::ObjectGrouper;
use mantle::operation::Operation;
use mantle::operation_grouper::OperationGrouper;
use proptest::prelude::*;

fn object_at(addr: usize) -> *mut Object {
    // 16-byte alignment matches `Object`'s `repr(align(16))`; these
    // pointers are opaque cache keys here and are never dereferenced.
    addr as *mut Object
}

proptest! {
    /// Net delta after flushing equals the arithmetic sum of every signed
    /// value written for that object, independent of write order and cache
    /// eviction churn, as long as every write targets one of a small set of
    /// objects (so collisions and evictions actually happen).
    #[test]
    fn operation_grouper_nets_to_the_arithmetic_sum(
        deltas in prop::collection::vec((0usize..4, 0u8..2, 0u8..4), 1..64)
    ) {
        let mut grouper = OperationGrouper::new(4, 2);
        let mut expected = [0i64; 4];

        for (object_index, sign, exponent) in &deltas {
            let object = object_at(0x1000 + object_index * 16);
            let operation = if *sign == 0 {
                Operation::increment(object, *exponent)
            } else {
                Operation::decrement(object, *exponent)
            };
            expected[*object_index] += operation.value();
            grouper.write(operation, false);
        }
        grouper.flush(true);

        let mut actual = [0i64; 4];
        for &(object, delta) in grouper.increments().iter().chain(grouper.decrements()) {
            for (index, value) in actual.iter_mut().enumerate() {
                if object == object_at(0x1000 + index * 16) {
                    *value += delta;
                }
            }
        }

        prop_assert_eq!(actual, expected);
    }
}

proptest! {
    /// Every object handed to `write` shows up in exactly one group after
    /// `flush`, and a group's members all carry that group's tag.
    #[test]
    fn object_grouper_preserves_every_object_in_exactly_one_group(
        groups in prop::collection::vec(0u16..8, 1..128)
    ) {
        let mut grouper = ObjectGrouper::new(true);
        let boxed: Vec<*mut Object> = groups.iter().map(|&g| Box::into_raw(Box::new(Object::new(g)))).collect();

        for &object in &boxed {
            unsafe { grouper.write(object); }
        }
        let result = grouper.flush();

        let mut total_members = 0;
        if let Some((min, max)) = result.group_range() {
            for group in min..=max {
                for &member in result.group_members(group) {
                    let tag = unsafe { (*member).group() };
                    prop_assert_eq!(tag, group);
                    total_members += 1;
                }
            }
        }
        prop_assert_eq!(total_members, boxed.len());

        for object in boxed {
            unsafe { drop(Box::from_raw(object)); }
        }
    }

    /// Disabling grouping returns every object, ungrouped, with none lost.
    #[test]
    fn disabled_object_grouper_returns_every_object(
        groups in prop::collection::vec(any::<ObjectGroup>(), 1..64)
    ) {
        let mut grouper = ObjectGrouper::new(false);
        let boxed: Vec<*mut Object> = groups.iter().map(|&g| Box::into_raw(Box::new(Object::new(g)))).collect();

        for &object in &boxed {
            unsafe { grouper.write(object); }
        }
        let result = grouper.flush();

        prop_assert_eq!(result.objects().len(), boxed.len());
        for &object in &boxed {
            prop_assert!(result.objects().contains(&object));
        }

        for object in boxed {
            unsafe { drop(Box::from_raw(object)); }
        }
    }
}
