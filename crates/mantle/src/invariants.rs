//! Debug-only assertion macros for the runtime's cross-thread invariants.
//!
//! Each macro is active only under `#[cfg(debug_assertions)]`, so there is
//! zero overhead in release builds. Named for the property checked, not by
//! an id scheme — the message itself is the documentation.

/// A sequence-like counter must only move forward.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} moved backward: {} to {}",
            $name,
            $old,
            $new
        )
    };
}

/// A segment cursor must stay within the bounds of its backing storage.
macro_rules! debug_assert_cursor_in_bounds {
    ($cursor:expr, $capacity:expr) => {
        debug_assert!(
            $cursor <= $capacity,
            "cursor {} exceeds segment capacity {}",
            $cursor,
            $capacity
        )
    };
}

/// A segment whose guard page is being touched must be primed.
macro_rules! debug_assert_primed {
    ($segment:expr) => {
        debug_assert!(
            $segment.is_primed(),
            "touched a write-barrier segment whose guard page was not primed"
        )
    };
}

/// Within one cycle, increments for an object must be applied before any of
/// its decrements are.
macro_rules! debug_assert_increments_before_decrements {
    ($increments_applied:expr, $decrements_pending:expr) => {
        debug_assert!(
            $increments_applied || !$decrements_pending,
            "decrement applied before the cycle's increments were"
        )
    };
}

/// The operation grouper's output must conserve the sum of input values.
macro_rules! debug_assert_netting_conserved {
    ($input_sum:expr, $output_sum:expr) => {
        debug_assert_eq!(
            $input_sum, $output_sum,
            "operation grouper changed the net value of its inputs"
        )
    };
}

pub(crate) use debug_assert_cursor_in_bounds;
pub(crate) use debug_assert_increments_before_decrements;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_netting_conserved;
pub(crate) use debug_assert_primed;
